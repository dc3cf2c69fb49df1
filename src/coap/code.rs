//! Request methods and response codes.
//!
//! A CoAP code byte is split into a 3-bit class and a 5-bit detail and is
//! conventionally written `c.dd` (`0x45` is `2.05 Content`).

use std::fmt;

/// Request method code (class 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Fetch = 5,
    Patch = 6,
    IPatch = 7,
}

impl Method {
    /// All methods, in code order.
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Fetch,
        Method::Patch,
        Method::IPatch,
    ];

    /// Code byte carried in the CoAP header.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a code byte back to a method.
    pub fn from_code(code: u8) -> Option<Self> {
        Method::ALL.into_iter().find(|m| m.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Fetch => "FETCH",
            Method::Patch => "PATCH",
            Method::IPatch => "iPATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    /// 0.00, carried by empty acknowledgements and resets.
    pub const EMPTY: ResponseCode = ResponseCode(0);

    pub const CREATED: ResponseCode = ResponseCode(65);
    pub const DELETED: ResponseCode = ResponseCode(66);
    pub const VALID: ResponseCode = ResponseCode(67);
    pub const CHANGED: ResponseCode = ResponseCode(68);
    pub const CONTENT: ResponseCode = ResponseCode(69);
    pub const CONTINUE: ResponseCode = ResponseCode(95);

    pub const BAD_REQUEST: ResponseCode = ResponseCode(128);
    pub const UNAUTHORIZED: ResponseCode = ResponseCode(129);
    pub const BAD_OPTION: ResponseCode = ResponseCode(130);
    pub const FORBIDDEN: ResponseCode = ResponseCode(131);
    pub const NOT_FOUND: ResponseCode = ResponseCode(132);
    pub const METHOD_NOT_ALLOWED: ResponseCode = ResponseCode(133);
    pub const NOT_ACCEPTABLE: ResponseCode = ResponseCode(134);
    pub const REQUEST_ENTITY_INCOMPLETE: ResponseCode = ResponseCode(136);
    pub const CONFLICT: ResponseCode = ResponseCode(137);
    pub const PRECONDITION_FAILED: ResponseCode = ResponseCode(140);
    pub const REQUEST_ENTITY_TOO_LARGE: ResponseCode = ResponseCode(141);
    pub const UNSUPPORTED_CONTENT_FORMAT: ResponseCode = ResponseCode(143);
    pub const UNPROCESSABLE_ENTITY: ResponseCode = ResponseCode(150);

    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode(160);
    pub const NOT_IMPLEMENTED: ResponseCode = ResponseCode(161);
    pub const BAD_GATEWAY: ResponseCode = ResponseCode(162);
    pub const SERVICE_UNAVAILABLE: ResponseCode = ResponseCode(163);
    pub const GATEWAY_TIMEOUT: ResponseCode = ResponseCode(164);
    pub const PROXYING_NOT_SUPPORTED: ResponseCode = ResponseCode(165);

    /// Upper three bits.
    #[inline]
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Lower five bits.
    #[inline]
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Class 2.
    #[inline]
    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Human-readable reason phrase, if the code is a known response code.
    pub fn reason(self) -> Option<&'static str> {
        let reason = match self.0 {
            65 => "Created",
            66 => "Deleted",
            67 => "Valid",
            68 => "Changed",
            69 => "Content",
            95 => "Continue",
            128 => "Bad Request",
            129 => "Unauthorized",
            130 => "Bad Option",
            131 => "Forbidden",
            132 => "Not Found",
            133 => "Method Not Allowed",
            134 => "Not Acceptable",
            136 => "Request Entity Incomplete",
            137 => "Conflict",
            140 => "Precondition Failed",
            141 => "Request Entity Too Large",
            143 => "Unsupported Content-Format",
            150 => "Unprocessable Entity",
            160 => "Internal Server Error",
            161 => "Not Implemented",
            162 => "Bad Gateway",
            163 => "Service Unavailable",
            164 => "Gateway Timeout",
            165 => "Proxying Not Supported",
            _ => return None,
        };
        Some(reason)
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        ResponseCode(code)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())?;
        if let Some(reason) = self.reason() {
            write!(f, " {}", reason)?;
        }
        Ok(())
    }
}
