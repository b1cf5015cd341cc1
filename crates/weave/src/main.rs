//! weave CLI entry point.
//!
//! Runs a markdown source with executable code cells against a Jupyter
//! kernel, either as a live server that re-renders on every edit or as a
//! one-shot batch render.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser as ClapParser;
use log::{info, warn};
use tokio::sync::{broadcast, mpsc};
use weave_doc::{reconcile, report, Document, Parser};

use weave::coordinator::{Coordinator, Event};
use weave::kernel::Kernel;
use weave::server::{self, AppState};
use weave::{batch, source};

#[derive(ClapParser, Debug)]
#[command(name = "weave")]
#[command(about = "Run a markdown document on a Jupyter kernel and render it live")]
struct Cli {
    /// Markdown source file to watch and execute
    source: PathBuf,

    /// HTML report path (default: source with .html extension; in batch
    /// mode the document goes to stdout unless this is given)
    #[arg(short = 'o', long)]
    report: Option<PathBuf>,

    /// Kernelspec to launch
    #[arg(long, default_value = "python3")]
    kernel: String,

    /// Fence language that marks executable cells
    #[arg(long, default_value = "python")]
    language: String,

    /// Address for the live server
    #[arg(long, default_value = "127.0.0.1:8081")]
    bind: SocketAddr,

    /// Execute every cell once, write the document, and exit
    #[arg(long)]
    batch: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let text = match std::fs::read_to_string(&cli.source) {
        Ok(text) => text,
        Err(e) => {
            warn!("[weave] Cannot read {:?} yet: {}", cli.source, e);
            String::new()
        }
    };
    let report_path = cli
        .report
        .clone()
        .unwrap_or_else(|| cli.source.with_extension("html"));

    let parser = Parser::new(&cli.language);
    let (events_tx, events_rx) = mpsc::channel::<Event>(1024);

    if cli.batch {
        return run_batch(&cli, parser.parse(&text), events_tx, events_rx).await;
    }

    let mut cells = parser.parse(&text);
    if let Ok(previous) = std::fs::read_to_string(&report_path) {
        let restored = report::resume(&mut cells, &previous);
        if restored > 0 {
            info!(
                "[weave] Resumed {} cells from {:?}",
                restored, report_path
            );
        }
    }

    let mut doc = Document::new();
    let outcome = reconcile(&mut doc, cells);
    info!(
        "[weave] Loaded {:?}: {} cells, {} to evaluate",
        cli.source,
        doc.order().len(),
        outcome.plan.len()
    );

    let mut kernel = Kernel::new(&cli.kernel, events_tx.clone());
    kernel.start().await?;
    for (hashid, code) in &outcome.plan {
        kernel.execute(hashid, code).await?;
    }

    report::write_report(&report_path, &doc)?;
    let doc = Arc::new(StdMutex::new(doc));

    let (broadcast_tx, _) = broadcast::channel::<String>(256);

    // Keep the debouncer alive for the life of the process.
    let source_path = std::path::absolute(&cli.source)?;
    let _watcher = source::spawn(source_path, events_tx.clone())?;

    let state = AppState {
        doc: doc.clone(),
        events: events_tx,
        broadcast: broadcast_tx.clone(),
    };
    let bind = cli.bind;
    tokio::spawn(async move {
        if let Err(e) = server::serve(bind, state).await {
            log::error!("[weave] Server failed: {}", e);
        }
    });

    Coordinator::new(doc, kernel, parser, events_rx, broadcast_tx, report_path)
        .run()
        .await;
    Ok(())
}

async fn run_batch(
    cli: &Cli,
    cells: Vec<weave_doc::Cell>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
) -> anyhow::Result<()> {
    let mut doc = Document::new();
    let outcome = reconcile(&mut doc, cells);
    info!(
        "[weave] Batch run of {:?}: {} cells to evaluate",
        cli.source,
        outcome.plan.len()
    );
    let doc = Arc::new(StdMutex::new(doc));

    let mut kernel = Kernel::new(&cli.kernel, events_tx);
    kernel.start().await?;

    match &cli.report {
        Some(path) => {
            let mut file = std::fs::File::create(path)?;
            batch::run(doc, kernel, outcome.plan, events_rx, &mut file).await
        }
        None => {
            let mut stdout = std::io::stdout();
            batch::run(doc, kernel, outcome.plan, events_rx, &mut stdout).await
        }
    }
}
