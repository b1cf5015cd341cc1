//! Batch mode: drive every code cell to completion once, write one static
//! document, and stop. There is no live reconciliation loop and no
//! resume-from-report: any failure aborts the whole run.

use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};

use log::warn;
use tokio::sync::mpsc;
use weave_doc::{report, Cell, CellStatus, Document, Hashid};

use crate::coordinator::{apply_message, Event};
use crate::kernel::Kernel;

/// Execute the whole document and stream the rendered page to `writer`.
///
/// The caller has already started the kernel (startup-complete) and built
/// the document; `plan` is every code cell in document order.
pub async fn run(
    doc: Arc<StdMutex<Document>>,
    mut kernel: Kernel,
    plan: Vec<(Hashid, String)>,
    events: mpsc::Receiver<Event>,
    writer: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let dispatch = tokio::spawn(dispatch_loop(doc.clone(), events));

    // Submit everything up front, in document order.
    let mut submit_result = Ok(());
    for (hashid, code) in &plan {
        if let Err(e) = kernel.execute(hashid, code).await {
            submit_result = Err(e);
            break;
        }
    }

    let result = match submit_result {
        Ok(()) => write_document(&doc, writer).await,
        Err(e) => Err(e),
    };

    dispatch.abort();
    kernel.shutdown().await.ok();
    result
}

/// Apply kernel messages to cells while the writer waits on them.
async fn dispatch_loop(doc: Arc<StdMutex<Document>>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let Event::Kernel {
            hashid: Some(hashid),
            content,
        } = event
        else {
            continue;
        };
        let mut doc = doc.lock().unwrap();
        if let Some(cell) = doc.code_cell_mut(&hashid) {
            if let Err(e) = apply_message(cell, &content) {
                warn!("[batch] Rejected message for cell {}: {}", hashid, e);
            }
        }
    }
}

/// Wait for each cell in document order and stream its HTML out. The first
/// errored cell aborts the run; nothing after the failure point is written.
pub(crate) async fn write_document(
    doc: &Arc<StdMutex<Document>>,
    writer: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let (front, back) = report::page_parts();
    writer.write_all(front.as_bytes())?;

    let order: Vec<Hashid> = { doc.lock().unwrap().order().to_vec() };
    for hashid in order {
        let wait = {
            let doc = doc.lock().unwrap();
            doc.get(&hashid).and_then(Cell::as_code).map(|c| c.wait_for())
        };
        if let Some(wait) = wait {
            wait.await;
        }

        let (html, errored) = {
            let doc = doc.lock().unwrap();
            let Some(cell) = doc.get(&hashid) else {
                continue;
            };
            let errored = cell
                .as_code()
                .is_some_and(|c| c.status() == CellStatus::Errored);
            (cell.html(), errored)
        };
        if errored {
            anyhow::bail!("cell {} failed during batch render", hashid);
        }
        writer.write_all(html.as_bytes())?;
        writer.write_all(b"\n")?;
    }

    writer.write_all(back.as_bytes())?;
    writer.flush()?;
    Ok(())
}
