//! Jupyter kernel lifecycle and message routing.
//!
//! Replies and iopub messages are correlated to the *request* that caused
//! them, not to a document cell, so every execution registers its
//! `msg_id -> hashid` route before the request is sent. The reader tasks
//! resolve that route and forward `(hashid, content)` events into the
//! coordinator's channel; messages with no resolvable route are forwarded
//! with no hashid and dropped there.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
    ShutdownRequest,
};
use log::{error, info};
use tokio::sync::mpsc;
use uuid::Uuid;
use weave_doc::Hashid;

use crate::coordinator::Event;

/// Shared mapping from execution request msg_id to the cell it runs.
type RouteMap = Arc<StdMutex<HashMap<String, Hashid>>>;

pub struct Kernel {
    kernelspec_name: String,
    events: mpsc::Sender<Event>,
    connection_info: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    session_id: String,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    shell_reader_task: Option<tokio::task::JoinHandle<()>>,
    shell_writer: Option<runtimelib::DealerSendConnection>,
    _process: Option<tokio::process::Child>,
    routes: RouteMap,
}

impl Kernel {
    pub fn new(kernelspec_name: &str, events: mpsc::Sender<Event>) -> Self {
        Kernel {
            kernelspec_name: kernelspec_name.to_string(),
            events,
            connection_info: None,
            connection_file: None,
            session_id: Uuid::new_v4().to_string(),
            iopub_task: None,
            shell_reader_task: None,
            shell_writer: None,
            _process: None,
            routes: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Launch the kernel and wait for it to answer a kernel_info handshake.
    /// Returning `Ok` is the startup-complete signal: the kernel is ready
    /// for execute requests.
    pub async fn start(&mut self) -> Result<()> {
        // Shutdown existing kernel if any
        self.shutdown().await.ok();

        let kernelspec = runtimelib::find_kernelspec(&self.kernelspec_name).await?;

        // Reserve ports
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(self.kernelspec_name.clone()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let connection_file_path =
            runtime_dir.join(format!("weave-kernel-{}.json", Uuid::new_v4()));
        tokio::fs::write(
            &connection_file_path,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "[kernel] Starting kernel {} at {:?}",
            self.kernelspec_name, connection_file_path
        );

        let process = kernelspec
            .command(&connection_file_path, Some(Stdio::null()), Some(Stdio::null()))?
            .kill_on_drop(true)
            .spawn()?;

        // Small delay to let the kernel start
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        self.session_id = Uuid::new_v4().to_string();

        // Create iopub connection and spawn listener
        let mut iopub = runtimelib::create_client_iopub_connection(
            &connection_info,
            "",
            &self.session_id,
        )
        .await?;

        let iopub_events = self.events.clone();
        let iopub_routes = self.routes.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        let hashid = resolve_route(&iopub_routes, &message);
                        let event = Event::Kernel {
                            hashid,
                            content: Box::new(message.content),
                        };
                        if iopub_events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[kernel] iopub read error: {}", e);
                        break;
                    }
                }
            }
        });

        // Create persistent shell connection
        let identity = runtimelib::peer_identity_for_session(&self.session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &self.session_id,
            identity,
        )
        .await?;

        // Verify kernel is alive with kernel_info handshake
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        let reply = tokio::time::timeout(std::time::Duration::from_secs(30), shell.read()).await;
        match reply {
            Ok(Ok(msg)) => {
                info!("[kernel] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                error!("[kernel] Error reading kernel_info_reply: {}", e);
                return Err(anyhow::anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                error!("[kernel] Timeout waiting for kernel_info_reply");
                return Err(anyhow::anyhow!("Kernel did not respond within 30s"));
            }
        }

        // Split shell into persistent writer + reader; execute replies
        // arrive on the reader and are routed like iopub traffic.
        let (shell_writer, mut shell_reader) = shell.split();

        let shell_events = self.events.clone();
        let shell_routes = self.routes.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => {
                        let hashid = resolve_route(&shell_routes, &message);
                        let event = Event::Kernel {
                            hashid,
                            content: Box::new(message.content),
                        };
                        if shell_events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[kernel] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        self.connection_info = Some(connection_info);
        self.connection_file = Some(connection_file_path);
        self.iopub_task = Some(iopub_task);
        self.shell_reader_task = Some(shell_reader_task);
        self.shell_writer = Some(shell_writer);
        self._process = Some(process);

        info!("[kernel] Kernel started");
        Ok(())
    }

    /// Submit code for execution and return the request msg_id. The
    /// `msg_id -> hashid` route is registered BEFORE sending so the reader
    /// tasks can resolve the earliest replies.
    pub async fn execute(&mut self, hashid: &Hashid, code: &str) -> Result<String> {
        let shell = self
            .shell_writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No kernel running"))?;

        let request = ExecuteRequest::new(code.to_string());
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        self.routes
            .lock()
            .unwrap()
            .insert(msg_id.clone(), hashid.clone());

        shell.send(message).await?;
        info!("[kernel] Sent execute_request: msg_id={} cell={}", msg_id, hashid);

        Ok(msg_id)
    }

    /// Drop every route pointing at a cell. Called before re-submitting a
    /// cell that may still have a request in flight: the superseded run's
    /// replies must not reach the reset cell's new generation.
    pub fn invalidate(&self, hashid: &Hashid) {
        self.routes
            .lock()
            .unwrap()
            .retain(|_, routed| *routed != *hashid);
    }

    /// Restart the kernel. Outstanding routes are invalidated: replies to
    /// requests submitted before the restart can no longer reach a cell.
    pub async fn restart(&mut self) -> Result<()> {
        info!("[kernel] Restarting");
        self.routes.lock().unwrap().clear();
        self.start().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        self.shell_writer = None;
        self.routes.lock().unwrap().clear();

        if let Some(connection_info) = &self.connection_info {
            let mut control =
                runtimelib::create_client_control_connection(connection_info, &self.session_id)
                    .await?;
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            control.send(request).await.ok();
        }

        if let Some(ref path) = self.connection_file {
            tokio::fs::remove_file(path).await.ok();
        }

        self.connection_info = None;
        self.connection_file = None;
        self._process = None;

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.connection_info.is_some()
    }
}

/// Look up the cell a message belongs to via its parent msg_id. An
/// execute_reply retires its route on the way out, so the map does not
/// accumulate entries for finished requests over a long session.
fn resolve_route(routes: &RouteMap, message: &JupyterMessage) -> Option<Hashid> {
    let parent = message.parent_header.as_ref()?;
    let mut routes = routes.lock().ok()?;
    if matches!(message.content, JupyterMessageContent::ExecuteReply(_)) {
        routes.remove(&parent.msg_id)
    } else {
        routes.get(&parent.msg_id).cloned()
    }
}
