// Copyright 2020 Joyent, Inc.

//! Credential sources consumed per-RPC by the transport layer.
//!
//! The cluster never caches tokens; a transport implementation asks its
//! credential source for a token on every RPC it dispatches.

use std::fmt;

use crate::context::Context;
use crate::error::Error;

/// An opaque auth token.
#[derive(Clone, Eq, PartialEq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: &str) -> Self {
        Token(String::from(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The token value must never reach logs.
impl fmt::Debug for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("Token(****)")
    }
}

pub trait Credentials: Send + Sync + 'static {
    fn token(&self, ctx: &Context) -> Result<Token, Error>;
}

/// A fixed access token.
pub struct StaticCredentials {
    token: Token,
}

impl StaticCredentials {
    pub fn new(access_token: &str) -> Self {
        StaticCredentials {
            token: Token::new(access_token),
        }
    }
}

impl Credentials for StaticCredentials {
    fn token(&self, _ctx: &Context) -> Result<Token, Error> {
        Ok(self.token.clone())
    }
}

/// No authentication at all.
pub struct AnonymousCredentials;

impl Credentials for AnonymousCredentials {
    fn token(&self, _ctx: &Context) -> Result<Token, Error> {
        Ok(Token::new(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_return_the_token() {
        let creds = StaticCredentials::new("s3cr3t");
        let token = creds.token(&Context::background()).unwrap();
        assert_eq!(token.as_str(), "s3cr3t");
    }

    #[test]
    fn token_debug_hides_the_value() {
        let token = Token::new("s3cr3t");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("s3cr3t"));
    }

    #[test]
    fn anonymous_credentials_are_empty() {
        let creds = AnonymousCredentials;
        let token = creds.token(&Context::background()).unwrap();
        assert!(token.as_str().is_empty());
    }
}
