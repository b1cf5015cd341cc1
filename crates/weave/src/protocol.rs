//! JSON wire messages exchanged with connected browser clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outbound broadcast to every connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One cell's fragment changed.
    Cell { hashid: String, html: String },
    /// The document structure changed. `htmls` carries only new and updated
    /// cells; clients keep their existing elements for the rest.
    Document {
        hashids: Vec<String>,
        htmls: BTreeMap<String, String>,
    },
}

/// Inbound request from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Reset a cell and run it again.
    Reevaluate { hashid: String },
    RestartKernel,
    Ping,
}
