// SPDX-License-Identifier: AGPL-3.0-only
//! AJP13 lookup tables: method codes, common request/response header codes and
//! forward-request attribute codes.

/// Method code meaning "the real method name follows as a stored-method attribute".
pub const SC_M_JK_STORED: u8 = 0xFF;

/// Method names by wire code; index 0 is code 1.
pub const METHODS: [&str; 27] = [
    "OPTIONS",
    "GET",
    "HEAD",
    "POST",
    "PUT",
    "DELETE",
    "TRACE",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "COPY",
    "MOVE",
    "LOCK",
    "UNLOCK",
    "ACL",
    "REPORT",
    "VERSION-CONTROL",
    "CHECKIN",
    "CHECKOUT",
    "UNCHECKOUT",
    "SEARCH",
    "MKWORKSPACE",
    "UPDATE",
    "LABEL",
    "MERGE",
    "BASELINE-CONTROL",
    "MKACTIVITY",
];

pub fn method_name(code: u8) -> Option<&'static str> {
    match code {
        1..=27 => Some(METHODS[code as usize - 1]),
        _ => None,
    }
}

pub fn method_code(name: &str) -> Option<u8> {
    METHODS
        .iter()
        .position(|m| *m == name)
        .map(|idx| idx as u8 + 1)
}

/// High byte marking a coded (table-indexed) header name.
pub const SC_HEADER_MARKER: u16 = 0xA000;

/// Common request header names by index; index 0 is code 0xA001.
pub const REQUEST_HEADERS: [&str; 14] = [
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "connection",
    "content-type",
    "content-length",
    "cookie",
    "cookie2",
    "host",
    "pragma",
    "referer",
    "user-agent",
];

/// Table index of `content-type` (code 0xA007).
pub const SC_REQ_CONTENT_TYPE: u16 = 7;
/// Table index of `content-length` (code 0xA008).
pub const SC_REQ_CONTENT_LENGTH: u16 = 8;

pub fn request_header_name(index: u16) -> Option<&'static str> {
    match index {
        1..=14 => Some(REQUEST_HEADERS[index as usize - 1]),
        _ => None,
    }
}

pub fn request_header_code(name: &str) -> Option<u16> {
    REQUEST_HEADERS
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .map(|idx| SC_HEADER_MARKER | (idx as u16 + 1))
}

/// Common response header names by index; index 0 is code 0xA001.
pub const RESPONSE_HEADERS: [&str; 11] = [
    "Content-Type",
    "Content-Language",
    "Content-Length",
    "Date",
    "Last-Modified",
    "Location",
    "Set-Cookie",
    "Set-Cookie2",
    "Servlet-Engine",
    "Status",
    "WWW-Authenticate",
];

pub fn response_header_name(index: u16) -> Option<&'static str> {
    match index {
        1..=11 => Some(RESPONSE_HEADERS[index as usize - 1]),
        _ => None,
    }
}

pub fn response_header_code(name: &str) -> Option<u16> {
    RESPONSE_HEADERS
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .map(|idx| SC_HEADER_MARKER | (idx as u16 + 1))
}

// Forward-request attribute codes.
pub const SC_A_CONTEXT: u8 = 0x01;
pub const SC_A_SERVLET_PATH: u8 = 0x02;
pub const SC_A_REMOTE_USER: u8 = 0x03;
pub const SC_A_AUTH_TYPE: u8 = 0x04;
pub const SC_A_QUERY_STRING: u8 = 0x05;
pub const SC_A_JVM_ROUTE: u8 = 0x06;
pub const SC_A_SSL_CERT: u8 = 0x07;
pub const SC_A_SSL_CIPHER: u8 = 0x08;
pub const SC_A_SSL_SESSION: u8 = 0x09;
pub const SC_A_REQ_ATTRIBUTE: u8 = 0x0A;
pub const SC_A_SSL_KEY_SIZE: u8 = 0x0B;
pub const SC_A_SECRET: u8 = 0x0C;
pub const SC_A_STORED_METHOD: u8 = 0x0D;
pub const SC_A_ARE_DONE: u8 = 0xFF;
