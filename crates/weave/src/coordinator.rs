//! The execution coordination loop.
//!
//! One task drains a single event channel fed by the kernel reader tasks,
//! the file watcher, and websocket clients, and is the only mutator of the
//! shared document in live mode. Every cell-mutating dispatch broadcasts the
//! cell's fresh HTML to connected clients and rewrites the report, so the
//! persisted artifact always reflects the latest state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use jupyter_protocol::{JupyterMessageContent, ReplyStatus};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use weave_doc::{render, report, CellError, CellStatus, CodeCell, Document, Hashid, Mime, Parser};

use crate::kernel::Kernel;
use crate::protocol::{ClientRequest, ServerEvent};

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum Event {
    /// A kernel message, with the cell resolved from its request token
    /// (or none, for messages no route matches).
    Kernel {
        hashid: Option<Hashid>,
        content: Box<JupyterMessageContent>,
    },
    /// The source file changed; carries the whole document text.
    SourceChanged(String),
    /// A request from a connected client.
    Client(ClientRequest),
}

pub struct Coordinator {
    doc: Arc<StdMutex<Document>>,
    kernel: Kernel,
    parser: Parser,
    events: mpsc::Receiver<Event>,
    broadcast: broadcast::Sender<String>,
    report_path: PathBuf,
}

impl Coordinator {
    pub fn new(
        doc: Arc<StdMutex<Document>>,
        kernel: Kernel,
        parser: Parser,
        events: mpsc::Receiver<Event>,
        broadcast: broadcast::Sender<String>,
        report_path: PathBuf,
    ) -> Self {
        Coordinator {
            doc,
            kernel,
            parser,
            events,
            broadcast,
            report_path,
        }
    }

    /// Drain events until every sender is gone.
    pub async fn run(mut self) {
        info!("[coordinator] Event loop started");
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Kernel { hashid, content } => self.handle_kernel(hashid, &content),
                Event::SourceChanged(text) => self.handle_source(&text).await,
                Event::Client(request) => self.handle_client(request).await,
            }
        }
        info!("[coordinator] Event channel closed");
    }

    fn handle_kernel(&mut self, hashid: Option<Hashid>, content: &JupyterMessageContent) {
        let Some(hashid) = hashid else {
            debug!(
                "[coordinator] Dropping {} with no cell route",
                content.message_type()
            );
            return;
        };

        let html = {
            let mut doc = self.doc.lock().unwrap();
            let Some(cell) = doc.code_cell_mut(&hashid) else {
                debug!("[coordinator] Cell {} no longer in document", hashid);
                return;
            };
            match apply_message(cell, content) {
                Ok(true) => Some(cell.html()),
                Ok(false) => None,
                Err(e) => {
                    warn!("[coordinator] Rejected {} for cell {}: {}", content.message_type(), hashid, e);
                    None
                }
            }
        };

        if let Some(html) = html {
            self.broadcast(&ServerEvent::Cell {
                hashid: hashid.to_string(),
                html,
            });
            self.save_report();
        }
    }

    async fn handle_source(&mut self, text: &str) {
        let parsed = self.parser.parse(text);
        let total = parsed.len();

        let (event, plan) = {
            let mut doc = self.doc.lock().unwrap();
            let outcome = weave_doc::reconcile(&mut doc, parsed);
            info!(
                "[coordinator] File change: {}/{} new cells, {}/{} updated cells",
                outcome.new_cells.len(),
                total,
                outcome.updated.len(),
                total
            );
            let htmls: BTreeMap<String, String> = outcome
                .changed()
                .filter_map(|hashid| {
                    doc.get(hashid)
                        .map(|cell| (hashid.to_string(), cell.html()))
                })
                .collect();
            let event = ServerEvent::Document {
                hashids: doc.order().iter().map(Hashid::to_string).collect(),
                htmls,
            };
            (event, outcome.plan)
        };

        self.broadcast(&event);
        self.save_report();

        // Submission order to the kernel equals document order.
        for (hashid, code) in plan {
            if let Err(e) = self.kernel.execute(&hashid, &code).await {
                error!("[coordinator] Failed to submit {}: {}", hashid, e);
            }
        }
    }

    async fn handle_client(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Reevaluate { hashid } => {
                info!("[coordinator] Will reevaluate cell {}", hashid);
                let hashid = Hashid::from(hashid.as_str());
                let prepared = {
                    let mut doc = self.doc.lock().unwrap();
                    let Some(cell) = doc.code_cell_mut(&hashid) else {
                        warn!("[coordinator] Reevaluate for unknown cell {}", hashid);
                        return;
                    };
                    cell.reset();
                    let _ = cell.set_evaluating();
                    (cell.code().to_string(), cell.html())
                };
                let (code, html) = prepared;
                // The previous run may still be in flight; its replies must
                // not reach the reset cell.
                self.kernel.invalidate(&hashid);
                self.broadcast(&ServerEvent::Cell {
                    hashid: hashid.to_string(),
                    html,
                });
                self.save_report();
                if let Err(e) = self.kernel.execute(&hashid, &code).await {
                    error!("[coordinator] Failed to submit {}: {}", hashid, e);
                }
            }
            ClientRequest::RestartKernel => {
                info!("[coordinator] Restarting kernel");
                if let Err(e) = self.kernel.restart().await {
                    error!("[coordinator] Kernel restart failed: {}", e);
                    return;
                }
                // The restart invalidated every outstanding route; cells left
                // Evaluating would otherwise hang forever, so reset them and
                // re-submit in document order.
                let resubmit = {
                    let mut doc = self.doc.lock().unwrap();
                    let stuck: Vec<Hashid> = doc
                        .order()
                        .iter()
                        .filter(|hashid| {
                            doc.get(hashid)
                                .and_then(|cell| cell.as_code())
                                .is_some_and(|cell| cell.status() == CellStatus::Evaluating)
                        })
                        .cloned()
                        .collect();
                    let mut resubmit = Vec::with_capacity(stuck.len());
                    for hashid in stuck {
                        if let Some(cell) = doc.code_cell_mut(&hashid) {
                            cell.reset();
                            let _ = cell.set_evaluating();
                            resubmit.push((hashid, cell.code().to_string()));
                        }
                    }
                    resubmit
                };
                self.save_report();
                for (hashid, code) in resubmit {
                    if let Err(e) = self.kernel.execute(&hashid, &code).await {
                        error!("[coordinator] Failed to resubmit {}: {}", hashid, e);
                    }
                }
            }
            ClientRequest::Ping => {}
        }
    }

    fn broadcast(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            // A send error just means no client is connected.
            Ok(text) => {
                let _ = self.broadcast.send(text);
            }
            Err(e) => error!("[coordinator] Failed to serialize event: {}", e),
        }
    }

    fn save_report(&self) {
        let doc = self.doc.lock().unwrap();
        if let Err(e) = report::write_report(&self.report_path, &doc) {
            warn!("[coordinator] Failed to save report: {}", e);
        }
    }
}

/// Outcome of dispatching one kernel message to a cell.
///
/// `Ok(true)` means the cell mutated and must be re-broadcast; `Ok(false)`
/// means the message kind carries no cell state (kernel status, input echo)
/// or was a duplicate terminal notification.
pub fn apply_message(
    cell: &mut CodeCell,
    content: &JupyterMessageContent,
) -> Result<bool, CellError> {
    match content {
        JupyterMessageContent::ExecuteResult(result) => {
            cell.set_output(media_to_output(&result.data))?;
            Ok(true)
        }
        JupyterMessageContent::DisplayData(data) => {
            cell.set_output(media_to_output(&data.data))?;
            Ok(true)
        }
        JupyterMessageContent::StreamContent(stream) => {
            cell.append_stream(&stream.text)?;
            Ok(true)
        }
        JupyterMessageContent::ExecuteReply(reply) => {
            if reply.status == ReplyStatus::Ok {
                cell.set_done()?;
                Ok(true)
            } else if cell.status() == CellStatus::Errored {
                // The iopub error message already landed; the error reply
                // adds nothing.
                Ok(false)
            } else {
                let traceback = reply
                    .error
                    .as_ref()
                    .map(|e| e.traceback.clone())
                    .unwrap_or_else(|| vec![format!("execution failed: {:?}", reply.status)]);
                cell.set_error(render::traceback_to_html(&traceback))?;
                Ok(true)
            }
        }
        JupyterMessageContent::ErrorOutput(error) => {
            if cell.status() == CellStatus::Errored {
                return Ok(false);
            }
            cell.set_error(render::traceback_to_html(&error.traceback))?;
            Ok(true)
        }
        JupyterMessageContent::Status(_) | JupyterMessageContent::ExecuteInput(_) => Ok(false),
        _ => {
            debug!("[coordinator] Ignoring {}", content.message_type());
            Ok(false)
        }
    }
}

/// Flatten a Jupyter media bundle into our content-type map. Unsupported
/// media types are dropped; multi-part text values are joined.
pub fn media_to_output(media: &jupyter_protocol::Media) -> BTreeMap<Mime, String> {
    let mut output = BTreeMap::new();
    let Ok(serde_json::Value::Object(entries)) = serde_json::to_value(media) else {
        return output;
    };
    for (media_type, value) in entries {
        let Some(mime) = Mime::from_media_type(&media_type) else {
            continue;
        };
        let text = match value {
            serde_json::Value::String(text) => text,
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.as_str())
                .collect::<String>(),
            other => other.to_string(),
        };
        output.insert(mime, text);
    }
    output
}
