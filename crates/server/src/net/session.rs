//! Session state machine
//!
//! One session per accepted connection. The session starts in the op
//! phase (device listing, import handshake), moves to the URB phase on a
//! successful import, and closes on EOF, decode error or socket error.
//!
//! Two tasks share the socket: the reader loop below and a writer task
//! that drains a bounded frame queue. Replies are pre-encoded complete
//! frames, so each queue element hits the wire as one uninterrupted byte
//! sequence, in completion order. Completion callbacks never touch the
//! socket; they only enqueue.

use anyhow::Result;
use protocol::{
    BusId, OpRequest, ProtocolError, UrbCommand, op_rep_devlist, op_rep_import_fail,
    op_rep_import_ok, read_op_request, read_urb_command,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::engine::UrbDispatcher;
use crate::usb::{AttachedDevice, Registry};

/// Depth of the outbound frame queue between completion callbacks and the
/// writer task.
const REPLY_QUEUE_DEPTH: usize = 256;

/// Drive one connection from the op phase to close.
///
/// Returns `Ok` on a clean close (EOF from the importer) and an error for
/// protocol violations or socket failures. Either way the attached device
/// is released and outstanding transfers are reaped before returning.
pub async fn run_session<S>(stream: S, registry: Arc<Registry>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (frames_tx, frames_rx) = async_channel::bounded::<Vec<u8>>(REPLY_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Ok(frame) = frames_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("socket write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // Op phase: devlist requests keep the session here; a successful
    // import moves it to the URB phase.
    let mut attached: Option<(BusId, AttachedDevice)> = None;
    let mut session_error: Option<ProtocolError> = None;

    while attached.is_none() {
        match read_op_request(&mut reader).await {
            Ok(OpRequest::Devlist) => {
                let devices = registry.list();
                debug!(count = devices.len(), "devlist requested");
                if frames_tx.send(op_rep_devlist(&devices)).await.is_err() {
                    break;
                }
            }
            Ok(OpRequest::Import { busid }) => match registry.attach(&busid) {
                Ok(device) => {
                    info!(busid = %busid, "importer attached");
                    if frames_tx.send(op_rep_import_ok(&device.record)).await.is_err() {
                        registry.detach(&busid);
                        break;
                    }
                    attached = Some((busid, device));
                }
                Err(e) => {
                    info!(busid = %busid, "import refused: {e}");
                    if frames_tx.send(op_rep_import_fail()).await.is_err() {
                        break;
                    }
                }
            },
            Err(e) => {
                if !is_clean_eof(&e) {
                    session_error = Some(e);
                }
                break;
            }
        }
    }

    if let Some((busid, device)) = attached {
        let dispatcher = UrbDispatcher::new(device, frames_tx.clone());

        loop {
            match read_urb_command(&mut reader).await {
                Ok(UrbCommand::Submit(cmd)) => {
                    trace!(seqnum = cmd.seqnum, ep = cmd.ep, "submit");
                    dispatcher.submit(cmd).await;
                }
                Ok(UrbCommand::Unlink(cmd)) => {
                    debug!(seqnum = cmd.seqnum, target = cmd.target_seqnum, "unlink");
                    dispatcher.unlink(cmd);
                }
                Err(e) => {
                    if !is_clean_eof(&e) {
                        session_error = Some(e);
                    }
                    break;
                }
            }
        }

        // Cancel whatever is still in flight and wait for the contexts to
        // drain before the socket goes away.
        dispatcher.shutdown().await;
        registry.detach(&busid);
        info!(busid = %busid, "importer detached");
    }

    // Completion closures may still hold sender clones; closing the
    // channel (after the queue drains) is what lets the writer task exit.
    frames_tx.close();
    let _ = writer_task.await;

    match session_error {
        None => Ok(()),
        Some(e) => {
            warn!("session terminated: {e}");
            Err(e.into())
        }
    }
}

/// EOF on a frame boundary is a clean close, not a protocol violation.
fn is_clean_eof(e: &ProtocolError) -> bool {
    matches!(e, ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}
