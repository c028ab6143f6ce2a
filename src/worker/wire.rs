//! The fixed header a worker child writes before its serialized result,
//! per §6 "Worker result wire format".

use crate::error::{Error, Result};

pub(crate) const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Ok = 0,
    Err = 1,
    Spilled = 2,
}

impl Status {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Err),
            2 => Ok(Status::Spilled),
            other => Err(Error::WorkerFailure(format!("bad wire status byte {other}"))),
        }
    }
}

/// `{status: u8, length: u64}` followed by `length` bytes of body.
pub(crate) fn encode_header(status: Status, length: u64) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = status as u8;
    out[1..9].copy_from_slice(&length.to_le_bytes());
    out
}

pub(crate) fn decode_header(bytes: &[u8]) -> Result<(Status, u64)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::WorkerFailure("short worker result header".into()));
    }
    let status = Status::from_byte(bytes[0])?;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[1..9]);
    Ok((status, u64::from_le_bytes(len_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = encode_header(Status::Spilled, 12345);
        let (status, len) = decode_header(&header).unwrap();
        assert_eq!(status, Status::Spilled);
        assert_eq!(len, 12345);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(decode_header(&[0u8; 3]).is_err());
    }
}
