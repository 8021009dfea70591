use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::msg::Msg;
use crate::types::SeqNum;

pub const WIRE_VERSION: u8 = 1;

/// Кадр канала: сообщение (возможно с multicast-метаданными) или keep-alive.
/// `FtGroupPing` шлёт узел fault-tolerant группы.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Msg {
        msg: Msg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
    },
    Ping,
    FtGroupPing(u8),
}

impl Frame {
    /// Unicast-кадр без номера последовательности.
    pub fn unicast(msg: impl Into<Msg>) -> Self {
        Frame::Msg {
            msg: msg.into(),
            seq_num: None,
            ft_group_id: None,
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    out.push(WIRE_VERSION);
    out.extend_from_slice(&postcard::to_allocvec(frame)?);
    Ok(out)
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame, WireError> {
    let (&ver, payload) = buf.split_first().ok_or(WireError::EmptyFrame)?;
    if ver != WIRE_VERSION {
        return Err(WireError::UnsupportedWireVersion(ver));
    }
    Ok(postcard::from_bytes(payload)?)
}

/// Копия одного сообщения (без версии) для буферов, переживающих исходный кадр.
pub fn encode_msg(msg: &Msg) -> Result<Vec<u8>, WireError> {
    Ok(postcard::to_allocvec(msg)?)
}

pub fn decode_msg(buf: &[u8]) -> Result<Msg, WireError> {
    if buf.is_empty() {
        return Err(WireError::EmptyFrame);
    }
    Ok(postcard::from_bytes(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::UpdateMsg;
    use crate::types::DomainType;

    #[test]
    fn frame_carries_multicast_metadata() {
        let frame = Frame::Msg {
            msg: UpdateMsg::new(0, DomainType::MARKET_PRICE).into(),
            seq_num: Some(42),
            ft_group_id: Some(3),
        };

        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn decode_rejects_empty_and_foreign_version() {
        assert!(matches!(decode_frame(&[]), Err(WireError::EmptyFrame)));
        assert!(matches!(
            decode_frame(&[9, 0]),
            Err(WireError::UnsupportedWireVersion(9))
        ));
        assert!(matches!(decode_msg(&[]), Err(WireError::EmptyFrame)));
    }

    #[test]
    fn garbage_payload_is_a_postcard_error() {
        let err = decode_frame(&[WIRE_VERSION, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, WireError::Codec(_)));
    }
}
