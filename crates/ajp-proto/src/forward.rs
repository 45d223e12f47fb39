// SPDX-License-Identifier: AGPL-3.0-only
//! JK_AJP13_FORWARD_REQUEST body: decoding into a request value and encoding
//! for the web-server side (client helpers and tests).

use crate::headers::{
    SC_A_ARE_DONE, SC_A_AUTH_TYPE, SC_A_CONTEXT, SC_A_JVM_ROUTE, SC_A_QUERY_STRING,
    SC_A_REMOTE_USER, SC_A_REQ_ATTRIBUTE, SC_A_SECRET, SC_A_SERVLET_PATH, SC_A_SSL_CERT,
    SC_A_SSL_CIPHER, SC_A_SSL_KEY_SIZE, SC_A_SSL_SESSION, SC_A_STORED_METHOD, SC_HEADER_MARKER,
    SC_M_JK_STORED, SC_REQ_CONTENT_LENGTH, SC_REQ_CONTENT_TYPE, method_code, method_name,
    request_header_code, request_header_name,
};
use crate::{JK_AJP13_FORWARD_REQUEST, Msg, MsgError};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub context: Option<String>,
    pub servlet_path: Option<String>,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    pub query_string: Option<String>,
    pub route: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_session: Option<String>,
    pub ssl_key_size: Option<u16>,
    pub secret: Option<String>,
    pub stored_method: Option<String>,
    /// Arbitrary name/value pairs forwarded with SC_A_REQ_ATTRIBUTE.
    pub request_attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub method: String,
    pub protocol: String,
    pub request_uri: String,
    pub remote_addr: String,
    pub remote_host: Option<String>,
    pub server_name: String,
    pub server_port: u16,
    pub is_ssl: bool,
    pub scheme: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub attributes: RequestAttributes,
}

impl ForwardRequest {
    pub fn new(method: &str, request_uri: &str) -> Self {
        Self {
            method: method.to_string(),
            protocol: "HTTP/1.1".to_string(),
            request_uri: request_uri.to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
            server_name: "localhost".to_string(),
            server_port: 80,
            is_ssl: false,
            scheme: "http".to_string(),
            headers: Vec::new(),
            content_length: None,
            content_type: None,
            attributes: RequestAttributes::default(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Decodes a forward request whose prefix byte has already been consumed.
pub fn decode_forward_request(msg: &mut Msg) -> Result<ForwardRequest, MsgError> {
    let method_code = msg.get_byte()?;
    let method = if method_code == SC_M_JK_STORED {
        None
    } else {
        Some(method_name(method_code).ok_or(MsgError::UnknownMethod(method_code))?)
    };

    let protocol = msg.get_string()?.unwrap_or_default();
    let request_uri = msg.get_string()?.unwrap_or_default();
    let remote_addr = msg.get_string()?.unwrap_or_default();
    let remote_host = msg.get_string()?;
    let server_name = msg.get_string()?.unwrap_or_default();
    let server_port = msg.get_int()?;
    let is_ssl = msg.get_byte()? != 0;

    let mut request = ForwardRequest {
        method: method.unwrap_or_default().to_string(),
        protocol,
        request_uri,
        remote_addr,
        remote_host,
        server_name,
        server_port,
        is_ssl,
        scheme: if is_ssl { "https" } else { "http" }.to_string(),
        headers: Vec::new(),
        content_length: None,
        content_type: None,
        attributes: RequestAttributes::default(),
    };

    decode_headers(msg, &mut request)?;
    decode_attributes(msg, &mut request)?;

    if method_code == SC_M_JK_STORED {
        request.method = request
            .attributes
            .stored_method
            .clone()
            .ok_or(MsgError::UnknownMethod(method_code))?;
    }
    Ok(request)
}

fn decode_headers(msg: &mut Msg, request: &mut ForwardRequest) -> Result<(), MsgError> {
    let count = msg.get_int()?;
    for _ in 0..count {
        // A name is either a 0xA0xx table code or a length-prefixed string.
        // A literal name whose length happens to fall in 0xA000..=0xA0FF is
        // read as a code; that ambiguity is part of the wire format.
        let peek = msg.peek_int()?;
        let (name, index) = if peek & 0xFF00 == SC_HEADER_MARKER {
            msg.get_int()?;
            let index = peek & 0x00FF;
            let name = request_header_name(index).ok_or(MsgError::UnknownHeader(peek))?;
            (name.to_string(), Some(index))
        } else {
            (msg.get_string()?.unwrap_or_default(), None)
        };
        let value = msg.get_string()?.unwrap_or_default();

        if index == Some(SC_REQ_CONTENT_LENGTH)
            || (index.is_none() && name.eq_ignore_ascii_case("Content-Length"))
        {
            match value.trim().parse::<u64>() {
                Ok(cl) if cl < i32::MAX as u64 => request.content_length = Some(cl),
                _ => debug!(value = %value, "ignoring unusable content-length"),
            }
        } else if index == Some(SC_REQ_CONTENT_TYPE)
            || (index.is_none() && name.eq_ignore_ascii_case("Content-Type"))
        {
            request.content_type = Some(value.clone());
        }
        request.headers.push((name, value));
    }
    Ok(())
}

fn decode_attributes(msg: &mut Msg, request: &mut ForwardRequest) -> Result<(), MsgError> {
    let attrs = &mut request.attributes;
    loop {
        let code = msg.get_byte()?;
        match code {
            SC_A_ARE_DONE => break,
            SC_A_REQ_ATTRIBUTE => {
                let name = msg.get_string()?.unwrap_or_default();
                let value = msg.get_string()?.unwrap_or_default();
                attrs.request_attributes.push((name, value));
            }
            SC_A_CONTEXT => attrs.context = msg.get_string()?,
            SC_A_SERVLET_PATH => attrs.servlet_path = msg.get_string()?,
            SC_A_REMOTE_USER => attrs.remote_user = msg.get_string()?,
            SC_A_AUTH_TYPE => attrs.auth_type = msg.get_string()?,
            SC_A_QUERY_STRING => attrs.query_string = msg.get_string()?,
            SC_A_JVM_ROUTE => attrs.route = msg.get_string()?,
            SC_A_SSL_CERT => {
                request.scheme = "https".to_string();
                attrs.ssl_cert = msg.get_string()?;
            }
            SC_A_SSL_CIPHER => {
                request.scheme = "https".to_string();
                attrs.ssl_cipher = msg.get_string()?;
            }
            SC_A_SSL_SESSION => {
                request.scheme = "https".to_string();
                attrs.ssl_session = msg.get_string()?;
            }
            SC_A_SSL_KEY_SIZE => attrs.ssl_key_size = Some(msg.get_int()?),
            SC_A_SECRET => attrs.secret = msg.get_string()?,
            SC_A_STORED_METHOD => attrs.stored_method = msg.get_string()?,
            other => debug!(code = other, "ignoring unknown AJP request attribute"),
        }
    }
    Ok(())
}

/// Encodes `request` as a complete packet bound for the container.
pub fn encode_forward_request(msg: &mut Msg, request: &ForwardRequest) -> Result<(), MsgError> {
    msg.reset();
    msg.append_byte(JK_AJP13_FORWARD_REQUEST)?;
    let code = method_code(&request.method);
    msg.append_byte(code.unwrap_or(SC_M_JK_STORED))?;
    msg.append_string(Some(request.protocol.as_str()))?;
    msg.append_string(Some(request.request_uri.as_str()))?;
    msg.append_string(Some(request.remote_addr.as_str()))?;
    msg.append_string(request.remote_host.as_deref())?;
    msg.append_string(Some(request.server_name.as_str()))?;
    msg.append_int(request.server_port)?;
    msg.append_byte(u8::from(request.is_ssl))?;

    msg.append_int(request.headers.len() as u16)?;
    for (name, value) in &request.headers {
        match request_header_code(name) {
            Some(code) => msg.append_int(code)?,
            None => msg.append_string(Some(name.as_str()))?,
        }
        msg.append_string(Some(value.as_str()))?;
    }

    let attrs = &request.attributes;
    let optional = [
        (SC_A_CONTEXT, &attrs.context),
        (SC_A_SERVLET_PATH, &attrs.servlet_path),
        (SC_A_REMOTE_USER, &attrs.remote_user),
        (SC_A_AUTH_TYPE, &attrs.auth_type),
        (SC_A_QUERY_STRING, &attrs.query_string),
        (SC_A_JVM_ROUTE, &attrs.route),
        (SC_A_SSL_CERT, &attrs.ssl_cert),
        (SC_A_SSL_CIPHER, &attrs.ssl_cipher),
        (SC_A_SSL_SESSION, &attrs.ssl_session),
        (SC_A_SECRET, &attrs.secret),
    ];
    for (code, value) in optional {
        if let Some(value) = value {
            msg.append_byte(code)?;
            msg.append_string(Some(value.as_str()))?;
        }
    }
    if let Some(size) = attrs.ssl_key_size {
        msg.append_byte(SC_A_SSL_KEY_SIZE)?;
        msg.append_int(size)?;
    }
    if code.is_none() {
        msg.append_byte(SC_A_STORED_METHOD)?;
        msg.append_string(Some(request.method.as_str()))?;
    }
    for (name, value) in &attrs.request_attributes {
        msg.append_byte(SC_A_REQ_ATTRIBUTE)?;
        msg.append_string(Some(name.as_str()))?;
        msg.append_string(Some(value.as_str()))?;
    }
    msg.append_byte(SC_A_ARE_DONE)?;
    msg.end_request();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: &ForwardRequest) -> ForwardRequest {
        let mut out = Msg::default();
        encode_forward_request(&mut out, request).unwrap();
        let packet = out.as_bytes().to_vec();

        let mut msg = Msg::default();
        msg.load(&packet).unwrap();
        assert_eq!(msg.get_byte().unwrap(), JK_AJP13_FORWARD_REQUEST);
        decode_forward_request(&mut msg).unwrap()
    }

    #[test]
    fn get_with_headers_survives_encode_decode() {
        let request = ForwardRequest::new("GET", "/app/index.jsp")
            .with_header("Host", "example.org")
            .with_header("X-Trace-Id", "abc123")
            .with_header("Accept", "text/html")
            .with_header("X-Empty", "");

        let decoded = roundtrip(&request);
        assert_eq!(decoded.method, "GET");
        assert_eq!(decoded.request_uri, "/app/index.jsp");
        assert_eq!(decoded.headers.len(), 4);
        // coded names come back in table spelling
        assert_eq!(decoded.headers[0], ("host".to_string(), "example.org".to_string()));
        assert_eq!(decoded.headers[1], ("X-Trace-Id".to_string(), "abc123".to_string()));
        assert_eq!(decoded.headers[2], ("accept".to_string(), "text/html".to_string()));
        assert_eq!(decoded.headers[3], ("X-Empty".to_string(), String::new()));
        assert_eq!(decoded.header("HOST"), Some("example.org"));
    }

    #[test]
    fn coded_content_headers_populate_request() {
        let request = ForwardRequest::new("POST", "/submit")
            .with_header("Content-Type", "application/json")
            .with_header("Content-Length", "42");

        let decoded = roundtrip(&request);
        assert_eq!(decoded.content_type.as_deref(), Some("application/json"));
        assert_eq!(decoded.content_length, Some(42));
    }

    #[test]
    fn literal_content_length_name_is_recognised() {
        // Hand-built so the name travels as a literal string, not a code.
        let mut msg = Msg::default();
        msg.append_byte(JK_AJP13_FORWARD_REQUEST).unwrap();
        msg.append_byte(4).unwrap();
        for field in ["HTTP/1.1", "/upload", "10.0.0.1"] {
            msg.append_string(Some(field)).unwrap();
        }
        msg.append_string(None).unwrap();
        msg.append_string(Some("www")).unwrap();
        msg.append_int(8080).unwrap();
        msg.append_byte(0).unwrap();
        msg.append_int(2).unwrap();
        msg.append_string(Some("CONTENT-LENGTH")).unwrap();
        msg.append_string(Some("7")).unwrap();
        msg.append_string(Some("content-type")).unwrap();
        msg.append_string(Some("text/plain")).unwrap();
        msg.append_byte(SC_A_ARE_DONE).unwrap();
        msg.end_request();
        let packet = msg.as_bytes().to_vec();

        let mut read = Msg::default();
        read.load(&packet).unwrap();
        read.get_byte().unwrap();
        let decoded = decode_forward_request(&mut read).unwrap();
        assert_eq!(decoded.method, "POST");
        assert_eq!(decoded.remote_host, None);
        assert_eq!(decoded.server_port, 8080);
        assert_eq!(decoded.content_length, Some(7));
        assert_eq!(decoded.content_type.as_deref(), Some("text/plain"));
        assert_eq!(decoded.headers[0].0, "CONTENT-LENGTH");
    }

    #[test]
    fn attributes_decode_until_terminator() {
        let mut request = ForwardRequest::new("GET", "/secure");
        request.is_ssl = true;
        request.attributes.query_string = Some("a=1&b=2".into());
        request.attributes.route = Some("node1".into());
        request.attributes.ssl_cipher = Some("TLS_AES_128_GCM_SHA256".into());
        request.attributes.ssl_key_size = Some(128);
        request.attributes.secret = Some("s3cret".into());
        request.attributes.remote_user = Some("webuser".into());
        request
            .attributes
            .request_attributes
            .push(("AJP_REMOTE_PORT".into(), "51234".into()));

        let decoded = roundtrip(&request);
        assert!(decoded.is_ssl);
        assert_eq!(decoded.scheme, "https");
        assert_eq!(decoded.attributes, request.attributes);
    }

    #[test]
    fn unknown_method_travels_as_stored_method() {
        let request = ForwardRequest::new("PATCH", "/items/1");
        let decoded = roundtrip(&request);
        assert_eq!(decoded.method, "PATCH");
        assert_eq!(decoded.attributes.stored_method.as_deref(), Some("PATCH"));
    }

    #[test]
    fn unknown_method_code_is_protocol_error() {
        let mut msg = Msg::default();
        msg.append_byte(JK_AJP13_FORWARD_REQUEST).unwrap();
        msg.append_byte(99).unwrap();
        msg.end_request();
        let packet = msg.as_bytes().to_vec();

        let mut read = Msg::default();
        read.load(&packet).unwrap();
        read.get_byte().unwrap();
        assert_eq!(
            decode_forward_request(&mut read),
            Err(MsgError::UnknownMethod(99))
        );
    }

    #[test]
    fn unknown_header_code_is_protocol_error() {
        let mut msg = Msg::default();
        msg.append_byte(JK_AJP13_FORWARD_REQUEST).unwrap();
        msg.append_byte(2).unwrap();
        for field in ["HTTP/1.1", "/", "10.0.0.1", "host", "www"] {
            msg.append_string(Some(field)).unwrap();
        }
        msg.append_int(80).unwrap();
        msg.append_byte(0).unwrap();
        msg.append_int(1).unwrap();
        msg.append_int(0xA0FE).unwrap();
        msg.append_string(Some("x")).unwrap();
        msg.append_byte(SC_A_ARE_DONE).unwrap();
        msg.end_request();
        let packet = msg.as_bytes().to_vec();

        let mut read = Msg::default();
        read.load(&packet).unwrap();
        read.get_byte().unwrap();
        assert_eq!(
            decode_forward_request(&mut read),
            Err(MsgError::UnknownHeader(0xA0FE))
        );
    }

    #[test]
    fn missing_terminator_is_truncated() {
        let mut out = Msg::default();
        encode_forward_request(&mut out, &ForwardRequest::new("GET", "/")).unwrap();
        let mut packet = out.as_bytes().to_vec();
        // drop the 0xFF terminator and fix up the length
        packet.pop();
        let body_len = (packet.len() - 4) as u16;
        packet[2..4].copy_from_slice(&body_len.to_be_bytes());

        let mut read = Msg::default();
        read.load(&packet).unwrap();
        read.get_byte().unwrap();
        assert!(matches!(
            decode_forward_request(&mut read),
            Err(MsgError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_request_fails_to_encode() {
        let big = "x".repeat(200);
        let request = ForwardRequest::new("GET", "/").with_header("X-Big", &big);
        let mut msg = Msg::new(128);
        assert!(matches!(
            encode_forward_request(&mut msg, &request),
            Err(MsgError::Overflow { .. })
        ));
    }
}
