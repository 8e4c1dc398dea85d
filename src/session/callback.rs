//! Foreign-callback ("WD") policy.
//!
//! Type 0 echoes a literal back. Type 1 goes to an optional query service
//! under its own quota. Anything else aborts. Every request, whatever its
//! type, spends from a per-session request budget.

use std::sync::Arc;

use log::{debug, warn};

use crate::config::types::{AbortReason, CallbackConfig, Result};
use crate::protocol::noun::decode_literal;
use crate::utils::text::{escape_control, truncate_chars};

pub const CALLBACK_TEXT: u32 = 0;
pub const CALLBACK_QUERY: u32 = 1;

/// External lookup service for type-1 callbacks.
pub trait QueryService: Send + Sync {
    fn query(&self, text: &str) -> Result<String>;
}

/// Acknowledgement sent back to the interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackReply {
    pub tag: u32,
    pub payload: Vec<u8>,
}

/// Per-session callback budget and routing
pub struct CallbackPolicy {
    remaining_requests: u32,
    remaining_queries: u32,
    query_width: usize,
    service: Option<Arc<dyn QueryService>>,
}

impl CallbackPolicy {
    /// `service` is only consulted when queries are enabled in `config`.
    pub fn new(config: &CallbackConfig, service: Option<Arc<dyn QueryService>>) -> Self {
        Self {
            remaining_requests: config.max_requests,
            remaining_queries: config.max_queries,
            query_width: config.query_width,
            service: if config.queries_enabled { service } else { None },
        }
    }

    pub fn handle(&mut self, kind: u32, payload: &[u8]) -> std::result::Result<CallbackReply, AbortReason> {
        self.remaining_requests = self
            .remaining_requests
            .checked_sub(1)
            .ok_or(AbortReason::TooManyCallbacks)?;

        let literal = decode_literal(payload);
        debug!(
            "wd {} \"{}\" literal={}",
            kind,
            escape_control(&String::from_utf8_lossy(payload)),
            literal.is_some()
        );

        match kind {
            CALLBACK_TEXT => literal
                .map(|text| CallbackReply { tag: 0, payload: text })
                .ok_or(AbortReason::InvalidCallback),
            CALLBACK_QUERY => {
                let service = self.service.as_ref().ok_or(AbortReason::CallbackDisabled)?;
                self.remaining_queries = self
                    .remaining_queries
                    .checked_sub(1)
                    .ok_or(AbortReason::TooManyQueries)?;
                let text = literal.ok_or(AbortReason::InvalidCallback)?;
                let text = String::from_utf8_lossy(&text);
                let text = truncate_chars(&text, self.query_width);

                match service.query(text) {
                    Ok(answer) => Ok(CallbackReply {
                        tag: 0,
                        payload: answer.into_bytes(),
                    }),
                    Err(e) => {
                        warn!("Query callback failed: {}", e);
                        Ok(CallbackReply {
                            tag: 1,
                            payload: Vec::new(),
                        })
                    }
                }
            }
            _ => Err(AbortReason::InvalidCallback),
        }
    }
}
