use quay_core::legacy::{ext, response_code};
use quay_core::messages::{SendMessageRequest, SendMessageResponse, SendReceipt, Status};
use quay_core::{Code, LegacyCommand, MessageId};

use crate::correlator::InvocationContext;

/// Turns a legacy response into a typed RPC response and completes the context.
///
/// `None` means the reply was delivered on another path; implementations must
/// not complete the context in that case.
pub trait ResponseHandler<Req, Resp>: Send + Sync {
    fn handle(&self, response: Option<LegacyCommand>, ctx: &InvocationContext<Req, Resp>);
}

/// Legacy response code to RPC status.
pub fn status_from_legacy(code: i32, remark: Option<&str>) -> Status {
    let rpc_code = match code {
        response_code::SUCCESS => return Status::ok(),
        response_code::FLUSH_DISK_TIMEOUT | response_code::FLUSH_SLAVE_TIMEOUT => {
            Code::DeadlineExceeded
        }
        response_code::SLAVE_NOT_AVAILABLE => Code::Unavailable,
        response_code::SYSTEM_BUSY => Code::ResourceExhausted,
        response_code::MESSAGE_ILLEGAL => Code::InvalidArgument,
        response_code::TOPIC_NOT_EXIST => Code::NotFound,
        response_code::NO_PERMISSION => Code::Forbidden,
        _ => Code::Internal,
    };
    let message = match remark {
        Some(remark) if !remark.is_empty() => remark.to_string(),
        _ => format!("broker responded with code {code}"),
    };
    Status::new(rpc_code, message)
}

/// Builds the send response carried by a legacy reply. Receipts are only
/// present on success.
pub fn build_send_message_response(command: &LegacyCommand) -> SendMessageResponse {
    let status = status_from_legacy(command.code, command.remark.as_deref());
    if !status.is_ok() {
        return SendMessageResponse {
            status,
            receipts: Vec::new(),
        };
    }

    match receipt_from_ext(command) {
        Ok(receipt) => SendMessageResponse {
            status,
            receipts: vec![receipt],
        },
        Err(detail) => SendMessageResponse {
            status: Status::new(Code::Internal, detail),
            receipts: Vec::new(),
        },
    }
}

fn receipt_from_ext(command: &LegacyCommand) -> Result<SendReceipt, String> {
    let queue_id = match command.ext(ext::QUEUE_ID) {
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|_| format!("malformed {} in send response: {raw}", ext::QUEUE_ID))?,
        None => -1,
    };
    let offset = match command.ext(ext::QUEUE_OFFSET) {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| format!("malformed {} in send response: {raw}", ext::QUEUE_OFFSET))?,
        None => -1,
    };
    Ok(SendReceipt {
        message_id: command
            .ext(ext::MSG_ID)
            .map(MessageId::from_raw)
            .unwrap_or_default(),
        transaction_id: command.ext(ext::TRANSACTION_ID).unwrap_or_default().to_string(),
        queue_id,
        offset,
    })
}

/// Translator for `SendMessage` calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendMessageResponseHandler;

impl ResponseHandler<SendMessageRequest, SendMessageResponse> for SendMessageResponseHandler {
    fn handle(
        &self,
        response: Option<LegacyCommand>,
        ctx: &InvocationContext<SendMessageRequest, SendMessageResponse>,
    ) {
        let Some(command) = response else {
            tracing::debug!(
                invocation_id = %ctx.id(),
                opaque = ctx.opaque(),
                "send reply travelling out of band"
            );
            return;
        };

        let mut response = build_send_message_response(&command);
        // The client knows its message by the id we handed the broker, not the broker's offset id.
        if let Some(message_id) = &ctx.metadata().message_id {
            for receipt in &mut response.receipts {
                receipt.message_id = message_id.clone();
            }
        }
        if !response.status.is_ok() {
            tracing::info!(
                invocation_id = %ctx.id(),
                legacy_code = command.code,
                status = %response.status.code,
                "broker rejected send"
            );
        }
        ctx.complete(response);
    }
}
