use relaycall_core::error::SignalingError;
use relaycall_core::traits::CloseReason;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Map a received close frame onto the reason reported to the owner
pub(crate) fn classify_close(frame: Option<&CloseFrame<'_>>) -> CloseReason {
    let Some(frame) = frame else {
        return CloseReason::Normal;
    };

    match frame.code {
        CloseCode::Normal => CloseReason::Normal,
        CloseCode::Away => CloseReason::GoingAway,
        CloseCode::Policy => CloseReason::Rejected(describe(frame)),
        _ => CloseReason::Abnormal(describe(frame)),
    }
}

fn describe(frame: &CloseFrame<'_>) -> String {
    let code = u16::from(frame.code);
    if frame.reason.is_empty() {
        format!("close code {code}")
    } else {
        format!("close code {code}: {}", frame.reason)
    }
}

/// Handshake failures; an auth refusal is not worth retrying
pub(crate) fn classify_connect_error(err: WsError) -> SignalingError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403) {
                SignalingError::Rejected(format!("handshake refused with {status}"))
            } else {
                SignalingError::Connect(format!("handshake failed with {status}"))
            }
        }
        WsError::Url(e) => SignalingError::InvalidUrl(e.to_string()),
        other => SignalingError::Connect(other.to_string()),
    }
}
