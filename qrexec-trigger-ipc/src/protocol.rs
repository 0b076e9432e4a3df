// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size wire records exchanged over the trigger pipe.
//!
//! The real protocol moves raw memory records, not framed/length-prefixed
//! messages: each side reads or writes exactly one record per step of the
//! handshake and treats any other byte count as a protocol violation. We
//! keep that shape here rather than reaching for a textual or
//! length-delimited codec, since there is nothing self-describing to frame.

use thiserror::Error;

/// Maximum length, in bytes, of the hex-encoded correlation identifier.
pub const IDENT_MAX_LEN: usize = 32;
/// Maximum length, in UTF-16 code units, of the service argument.
pub const EXEC_INDEX_MAX_LEN: usize = 32;
/// Maximum length, in UTF-16 code units, of the target VM name.
pub const VMNAME_MAX_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected a {expected}-byte record, got {actual} bytes")]
    BadSize { expected: usize, actual: usize },
    #[error("create_process_response carried unknown tag {0}")]
    UnknownResponseTag(u32),
    #[error("ident field is not valid UTF-8 / not nul-terminated within {0} bytes")]
    BadIdent(usize),
}

/// Server-assigned correlation token, copied verbatim into outgoing
/// daemon messages. Populated by the server, never by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFds {
    pub ident: [u8; IDENT_MAX_LEN],
}

impl ProcessFds {
    pub fn with_ident(ident: &str) -> Self {
        let mut buf = [0u8; IDENT_MAX_LEN];
        let bytes = ident.as_bytes();
        debug_assert!(bytes.len() < IDENT_MAX_LEN, "ident too long: {ident}");
        buf[..bytes.len()].copy_from_slice(bytes);
        ProcessFds { ident: buf }
    }

    pub fn ident_str(&self) -> Result<&str, ProtocolError> {
        let end = self
            .ident
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::BadIdent(IDENT_MAX_LEN))?;
        std::str::from_utf8(&self.ident[..end]).map_err(|_| ProtocolError::BadIdent(IDENT_MAX_LEN))
    }
}

/// First message read from a newly connected client.
///
/// `exec_index` and `target_vmname` are fixed-width UTF-16 buffers, nul
/// padded; the client fills them, the server fills `process_fds.ident`
/// after allocating an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConnectParams {
    pub process_fds: ProcessFds,
    pub exec_index: [u16; EXEC_INDEX_MAX_LEN],
    pub target_vmname: [u16; VMNAME_MAX_LEN],
}

impl TriggerConnectParams {
    pub const WIRE_SIZE: usize =
        IDENT_MAX_LEN + EXEC_INDEX_MAX_LEN * 2 + VMNAME_MAX_LEN * 2;

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::BadSize {
                expected: Self::WIRE_SIZE,
                actual: buf.len(),
            });
        }
        let mut ident = [0u8; IDENT_MAX_LEN];
        ident.copy_from_slice(&buf[0..IDENT_MAX_LEN]);

        let mut exec_index = [0u16; EXEC_INDEX_MAX_LEN];
        decode_utf16_field(&buf[IDENT_MAX_LEN..IDENT_MAX_LEN + EXEC_INDEX_MAX_LEN * 2], &mut exec_index);

        let vm_off = IDENT_MAX_LEN + EXEC_INDEX_MAX_LEN * 2;
        let mut target_vmname = [0u16; VMNAME_MAX_LEN];
        decode_utf16_field(&buf[vm_off..vm_off + VMNAME_MAX_LEN * 2], &mut target_vmname);

        Ok(TriggerConnectParams {
            process_fds: ProcessFds { ident },
            exec_index,
            target_vmname,
        })
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..IDENT_MAX_LEN].copy_from_slice(&self.process_fds.ident);
        encode_utf16_field(&self.exec_index, &mut out[IDENT_MAX_LEN..IDENT_MAX_LEN + EXEC_INDEX_MAX_LEN * 2]);
        let vm_off = IDENT_MAX_LEN + EXEC_INDEX_MAX_LEN * 2;
        encode_utf16_field(&self.target_vmname, &mut out[vm_off..vm_off + VMNAME_MAX_LEN * 2]);
        out
    }

    pub fn exec_index_string(&self) -> String {
        utf16_field_to_string(&self.exec_index)
    }

    pub fn target_vmname_string(&self) -> String {
        utf16_field_to_string(&self.target_vmname)
    }
}

fn decode_utf16_field(bytes: &[u8], out: &mut [u16]) {
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        out[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
    }
}

fn encode_utf16_field(units: &[u16], out: &mut [u8]) {
    for (i, unit) in units.iter().enumerate() {
        let b = unit.to_le_bytes();
        out[i * 2] = b[0];
        out[i * 2 + 1] = b[1];
    }
}

fn utf16_field_to_string(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Outcome reported by the client after process creation was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateProcessResponse {
    /// The client gave up before attempting process creation.
    None,
    /// Process creation failed with this OS error code.
    ErrorCode(u32),
    /// Process creation succeeded; payload is the remote-valued process handle.
    Handle(u64),
}

impl CreateProcessResponse {
    const TAG_NONE: u32 = 0;
    const TAG_ERROR_CODE: u32 = 1;
    const TAG_HANDLE: u32 = 2;

    pub const WIRE_SIZE: usize = 4 + 8;

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::BadSize {
                expected: Self::WIRE_SIZE,
                actual: buf.len(),
            });
        }
        let tag = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let payload = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        match tag {
            Self::TAG_NONE => Ok(CreateProcessResponse::None),
            Self::TAG_ERROR_CODE => Ok(CreateProcessResponse::ErrorCode(payload as u32)),
            Self::TAG_HANDLE => Ok(CreateProcessResponse::Handle(payload)),
            other => Err(ProtocolError::UnknownResponseTag(other)),
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let (tag, payload) = match *self {
            CreateProcessResponse::None => (Self::TAG_NONE, 0u64),
            CreateProcessResponse::ErrorCode(code) => (Self::TAG_ERROR_CODE, code as u64),
            CreateProcessResponse::Handle(h) => (Self::TAG_HANDLE, h),
        };
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&tag.to_le_bytes());
        out[4..12].copy_from_slice(&payload.to_le_bytes());
        out
    }
}

/// The triple of channel handles handed to the client in state S4, each
/// already valued in the client's own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHandles {
    pub stdin: u64,
    pub stdout: u64,
    pub stderr: u64,
}

impl IoHandles {
    pub const WIRE_SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..8].copy_from_slice(&self.stdin.to_le_bytes());
        out[8..16].copy_from_slice(&self.stdout.to_le_bytes());
        out[16..24].copy_from_slice(&self.stderr.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::BadSize {
                expected: Self::WIRE_SIZE,
                actual: buf.len(),
            });
        }
        Ok(IoHandles {
            stdin: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            stdout: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            stderr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_roundtrips_through_process_fds() {
        let fds = ProcessFds::with_ident("2a");
        assert_eq!(fds.ident_str().unwrap(), "2a");
    }

    #[test]
    fn trigger_connect_params_roundtrip() {
        let mut exec_index = [0u16; EXEC_INDEX_MAX_LEN];
        for (i, c) in "qubes.Service".encode_utf16().enumerate() {
            exec_index[i] = c;
        }
        let mut target_vmname = [0u16; VMNAME_MAX_LEN];
        for (i, c) in "dom0".encode_utf16().enumerate() {
            target_vmname[i] = c;
        }
        let params = TriggerConnectParams {
            process_fds: ProcessFds::with_ident("1"),
            exec_index,
            target_vmname,
        };
        let wire = params.encode();
        let decoded = TriggerConnectParams::decode(&wire).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(decoded.exec_index_string(), "qubes.Service");
        assert_eq!(decoded.target_vmname_string(), "dom0");
    }

    #[test]
    fn trigger_connect_params_rejects_short_read() {
        let err = TriggerConnectParams::decode(&[0u8; 4]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BadSize {
                expected: TriggerConnectParams::WIRE_SIZE,
                actual: 4
            }
        );
    }

    #[test]
    fn create_process_response_roundtrip_all_variants() {
        for resp in [
            CreateProcessResponse::None,
            CreateProcessResponse::ErrorCode(5),
            CreateProcessResponse::Handle(0xDEAD_BEEF),
        ] {
            let wire = resp.encode();
            assert_eq!(CreateProcessResponse::decode(&wire).unwrap(), resp);
        }
    }

    #[test]
    fn create_process_response_rejects_unknown_tag() {
        let mut buf = [0u8; CreateProcessResponse::WIRE_SIZE];
        buf[0..4].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            CreateProcessResponse::decode(&buf).unwrap_err(),
            ProtocolError::UnknownResponseTag(7)
        );
    }

    #[test]
    fn io_handles_roundtrip() {
        let handles = IoHandles {
            stdin: 1,
            stdout: 2,
            stderr: 3,
        };
        let wire = handles.encode();
        assert_eq!(IoHandles::decode(&wire).unwrap(), handles);
    }
}
