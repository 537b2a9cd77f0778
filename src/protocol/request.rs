//! Channel-open descriptor: which role to play and which local path to use.
//!
//! The descriptor arrives as SSH wire data: two length-prefixed strings
//! (`u32` big-endian length + bytes), the role flag then the path.

use crate::error::{Result, ScpError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `-t`: the peer pushes data to us
    Sink,
    /// `-f`: the peer pulls data from us
    Source,
}

impl Role {
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-t" => Some(Role::Sink),
            "-f" => Some(Role::Source),
            _ => None,
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            Role::Sink => "-t",
            Role::Source => "-f",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sink => write!(f, "sink"),
            Role::Source => write!(f, "source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub role: Role,
    pub path: String,
}

impl TransferRequest {
    pub fn new(role: Role, path: impl Into<String>) -> Self {
        Self {
            role,
            path: path.into(),
        }
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let flag = read_string(&mut payload, "role")?;
        let path = read_string(&mut payload, "path")?;
        let role = Role::from_flag(&flag)
            .ok_or_else(|| ScpError::InvalidRequest(format!("unknown mode {:?}", flag)))?;
        Ok(Self { role, path })
    }

    pub fn encode(&self) -> Bytes {
        let flag = self.role.flag().as_bytes();
        let path = self.path.as_bytes();
        let mut buf = BytesMut::with_capacity(8 + flag.len() + path.len());
        buf.put_u32(flag.len() as u32);
        buf.put_slice(flag);
        buf.put_u32(path.len() as u32);
        buf.put_slice(path);
        buf.freeze()
    }
}

fn read_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 4 {
        return Err(ScpError::InvalidRequest(format!("{} length truncated", what)));
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(ScpError::InvalidRequest(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| ScpError::InvalidRequest(format!("invalid UTF-8 in {}", what)))
}
