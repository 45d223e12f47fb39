// SPDX-License-Identifier: AGPL-3.0-only
//! Container -> web server packets: headers, body chunks, end of response,
//! body-chunk requests and CPONG; plus decoding for the web-server side.

use crate::headers::{SC_HEADER_MARKER, response_header_code, response_header_name};
use crate::{
    JK_AJP13_CPONG_REPLY, JK_AJP13_END_RESPONSE, JK_AJP13_GET_BODY_CHUNK,
    JK_AJP13_SEND_BODY_CHUNK, JK_AJP13_SEND_HEADERS, Msg, MsgError, SEND_CHUNK_OVERHEAD,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendHeaders {
    pub status: u16,
    pub message: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Headers(SendHeaders),
    BodyChunk(Vec<u8>),
    End { reuse: bool },
    GetBodyChunk(u16),
    CPong,
}

pub fn encode_send_headers(msg: &mut Msg, headers: &SendHeaders) -> Result<(), MsgError> {
    msg.reset();
    msg.append_byte(JK_AJP13_SEND_HEADERS)?;
    msg.append_int(headers.status)?;
    msg.append_string(Some(headers.message.as_str()))?;
    msg.append_int(headers.headers.len() as u16)?;
    for (name, value) in &headers.headers {
        match response_header_code(name) {
            Some(code) => msg.append_int(code)?,
            None => msg.append_string(Some(name.as_str()))?,
        }
        msg.append_string(Some(value.as_str()))?;
    }
    msg.end();
    Ok(())
}

/// Encodes as much of `data` as fits in one packet; returns the bytes consumed.
pub fn encode_body_chunk(msg: &mut Msg, data: &[u8]) -> Result<usize, MsgError> {
    let room = msg
        .capacity()
        .saturating_sub(crate::H_SIZE + SEND_CHUNK_OVERHEAD);
    let take = data.len().min(room);
    msg.reset();
    msg.append_byte(JK_AJP13_SEND_BODY_CHUNK)?;
    msg.append_bytes(&data[..take])?;
    msg.end();
    Ok(take)
}

pub fn encode_end_response(msg: &mut Msg, reuse: bool) -> Result<(), MsgError> {
    msg.reset();
    msg.append_byte(JK_AJP13_END_RESPONSE)?;
    msg.append_byte(u8::from(reuse))?;
    msg.end();
    Ok(())
}

pub fn encode_get_body_chunk(msg: &mut Msg, requested: u16) -> Result<(), MsgError> {
    msg.reset();
    msg.append_byte(JK_AJP13_GET_BODY_CHUNK)?;
    msg.append_int(requested)?;
    msg.end();
    Ok(())
}

pub fn encode_cpong(msg: &mut Msg) -> Result<(), MsgError> {
    msg.reset();
    msg.append_byte(JK_AJP13_CPONG_REPLY)?;
    msg.end();
    Ok(())
}

/// Decodes a container packet loaded into `msg` (cursor at the type byte).
pub fn decode_response(msg: &mut Msg) -> Result<Response, MsgError> {
    let kind = msg.get_byte()?;
    match kind {
        JK_AJP13_SEND_HEADERS => {
            let status = msg.get_int()?;
            let message = msg.get_string()?.unwrap_or_default();
            let count = msg.get_int()?;
            let mut headers = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let peek = msg.peek_int()?;
                let name = if peek & 0xFF00 == SC_HEADER_MARKER {
                    msg.get_int()?;
                    response_header_name(peek & 0x00FF)
                        .ok_or(MsgError::UnknownHeader(peek))?
                        .to_string()
                } else {
                    msg.get_string()?.unwrap_or_default()
                };
                let value = msg.get_string()?.unwrap_or_default();
                headers.push((name, value));
            }
            Ok(Response::Headers(SendHeaders {
                status,
                message,
                headers,
            }))
        }
        JK_AJP13_SEND_BODY_CHUNK => Ok(Response::BodyChunk(msg.get_bytes()?.unwrap_or_default())),
        JK_AJP13_END_RESPONSE => Ok(Response::End {
            reuse: msg.get_byte()? != 0,
        }),
        JK_AJP13_GET_BODY_CHUNK => Ok(Response::GetBodyChunk(msg.get_int()?)),
        JK_AJP13_CPONG_REPLY => Ok(Response::CPong),
        other => Err(MsgError::UnexpectedType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reload(msg: &Msg) -> Msg {
        let mut read = Msg::new(msg.capacity());
        read.load(msg.as_bytes()).unwrap();
        read
    }

    #[test]
    fn send_headers_codes_known_names() {
        let mut msg = Msg::default();
        let headers = SendHeaders {
            status: 401,
            message: "Unauthorized".into(),
            headers: vec![
                ("WWW-Authenticate".into(), "Basic realm=\"ajp\"".into()),
                ("X-Remote-User".into(), "alice".into()),
            ],
        };
        encode_send_headers(&mut msg, &headers).unwrap();
        assert_eq!(&msg.as_bytes()[..2], &[0x41, 0x42]);
        // the coded name sits right after the header count
        let body = &msg.as_bytes()[4..];
        let count_at = 1 + 2 + 2 + "Unauthorized".len() + 1;
        assert_eq!(&body[count_at..count_at + 4], &[0x00, 0x02, 0xA0, 0x0B]);

        let mut read = reload(&msg);
        assert_eq!(decode_response(&mut read).unwrap(), Response::Headers(headers));
    }

    #[test]
    fn body_chunk_splits_at_packet_capacity() {
        let mut msg = Msg::new(32);
        let data = vec![7u8; 100];
        let taken = encode_body_chunk(&mut msg, &data).unwrap();
        assert_eq!(taken, 32 - 4 - SEND_CHUNK_OVERHEAD);

        let mut read = reload(&msg);
        assert_eq!(
            decode_response(&mut read).unwrap(),
            Response::BodyChunk(vec![7u8; taken])
        );
    }

    #[test]
    fn end_response_and_cpong() {
        let mut msg = Msg::default();
        encode_end_response(&mut msg, true).unwrap();
        assert_eq!(msg.as_bytes(), &[0x41, 0x42, 0x00, 0x02, 0x05, 0x01]);
        let mut read = reload(&msg);
        assert_eq!(decode_response(&mut read).unwrap(), Response::End { reuse: true });

        encode_cpong(&mut msg).unwrap();
        assert_eq!(msg.as_bytes(), &[0x41, 0x42, 0x00, 0x01, 0x09]);
    }

    #[test]
    fn get_body_chunk_carries_requested_length() {
        let mut msg = Msg::default();
        encode_get_body_chunk(&mut msg, 8186).unwrap();
        let mut read = reload(&msg);
        assert_eq!(decode_response(&mut read).unwrap(), Response::GetBodyChunk(8186));
    }

    #[test]
    fn request_types_are_not_responses() {
        let mut msg = Msg::default();
        msg.append_byte(crate::JK_AJP13_FORWARD_REQUEST).unwrap();
        msg.end();
        let mut read = reload(&msg);
        assert_eq!(decode_response(&mut read), Err(MsgError::UnexpectedType(2)));
    }
}
