//! Frontend (client to server) message encoding.

use bytes::{BufMut, BytesMut};

/// Protocol 3.0, major version in the upper 16 bits.
pub const PROTOCOL_VERSION: u32 = 3 << 16;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const COPY_FAIL: Self = Self(b'f');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

/// Writes a length-prefixed body; the length includes its own 4 bytes.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn put_startup(buf: &mut BytesMut, params: &[(&str, &str)]) {
    frame(buf, |b| {
        b.put_u32(PROTOCOL_VERSION);
        for (key, val) in params {
            put_cstring(b, key);
            put_cstring(b, val);
        }
        b.put_u8(0);
    });
}

pub fn put_query(buf: &mut BytesMut, sql: &str) {
    MessageCode::QUERY.frame(buf, |b| put_cstring(b, sql));
}

pub fn put_password(buf: &mut BytesMut, password: &str) {
    MessageCode::PASSWORD_MESSAGE.frame(buf, |b| put_cstring(b, password));
}

pub fn put_sasl_initial_response(buf: &mut BytesMut, mechanism: &str, data: &[u8]) {
    MessageCode::SASL_RESPONSE.frame(buf, |b| {
        put_cstring(b, mechanism);
        b.put_i32(data.len() as i32);
        b.put_slice(data);
    });
}

pub fn put_sasl_response(buf: &mut BytesMut, data: &[u8]) {
    MessageCode::SASL_RESPONSE.frame(buf, |b| b.put_slice(data));
}

pub fn put_copy_fail(buf: &mut BytesMut, reason: &str) {
    MessageCode::COPY_FAIL.frame(buf, |b| put_cstring(b, reason));
}

pub fn put_terminate(buf: &mut BytesMut) {
    MessageCode::TERMINATE.frame(buf, |_| {});
}
