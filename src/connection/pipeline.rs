//! The four per-connection tasks and the barrier that joins them.

use super::framing::Framer;
use super::{Connection, OnReceive, OnStop};
use crate::error::{constants, ProtocolError};
use crate::transport::Transport;
use crate::utils::metrics::{global_metrics, Timer};
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info_span, warn, Instrument};

pub(super) struct Channels<T> {
    pub reader: ReadHalf<T>,
    pub data_tx: mpsc::Sender<usize>,
    pub data_rx: mpsc::Receiver<usize>,
    pub send_rx: mpsc::Receiver<()>,
}

pub(super) fn spawn<T: Transport>(
    conn: Connection,
    channels: Channels<T>,
    on_receive: OnReceive,
    on_stop: Option<OnStop>,
) {
    let span = info_span!("connection", session = %conn.session_id(), peer = %conn.source());

    tokio::spawn(
        async move {
            let reader = tokio::spawn(
                read_loop(conn.clone(), channels.reader, channels.data_tx).in_current_span(),
            );
            let processor = tokio::spawn(
                process_loop(conn.clone(), channels.data_rx, on_receive).in_current_span(),
            );
            let writer =
                tokio::spawn(write_loop(conn.clone(), channels.send_rx).in_current_span());
            let scheduler = tokio::spawn(schedule_loop(conn.clone()).in_current_span());

            let (r, p, w, s) = tokio::join!(reader, processor, writer, scheduler);
            for (task, result) in [("reader", r), ("processor", p), ("writer", w), ("scheduler", s)]
            {
                if let Err(e) = result {
                    error!(task, error = %e, "Pipeline task ended abnormally");
                }
            }

            conn.close();
            global_metrics().connection_stopped();
            if let Some(on_stop) = on_stop {
                on_stop(&conn);
            }
            debug!("Pipeline stopped");
        }
        .instrument(span),
    );
}

/// Move transport bytes into the receive buffer and notify the processor.
async fn read_loop<T: Transport>(
    conn: Connection,
    mut reader: ReadHalf<T>,
    data_tx: mpsc::Sender<usize>,
) {
    let mut chunk = vec![0u8; conn.config().read_chunk_size.max(1)];

    loop {
        let read = tokio::select! {
            _ = conn.inner.shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!("Peer closed the stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Transport read failed");
                global_metrics().connection_error();
                break;
            }
        };

        global_metrics().bytes_received(n);
        conn.inner.recv.write(&chunk[..n]);
        if data_tx.send(n).await.is_err() {
            break;
        }
    }

    conn.mark_close_requested();
    drop(data_tx);
    debug!("Stopped reading");
}

/// Run framing passes, one per notification, strictly in arrival order.
async fn process_loop(conn: Connection, mut data_rx: mpsc::Receiver<usize>, on_receive: OnReceive) {
    let mut framer = Framer::new(conn.clone(), on_receive);

    while let Some(n) = data_rx.recv().await {
        if n == 0 {
            continue;
        }

        let timer = Timer::start("framing_pass");
        let result = framer.process().await;
        global_metrics().decode_time(timer.elapsed());

        if let Err(e) = result {
            warn!(error = %e, "Closing connection after processing failure");
            global_metrics().protocol_error();
            break;
        }
        tokio::task::yield_now().await;
    }

    conn.close();
    debug!("Stopped processing");
}

/// Flush the send buffer whenever signalled.
async fn write_loop(conn: Connection, mut send_rx: mpsc::Receiver<()>) {
    loop {
        let signal = tokio::select! {
            _ = conn.inner.shutdown.cancelled() => None,
            signal = send_rx.recv() => signal,
        };
        if signal.is_none() {
            break;
        }

        if let Err(e) = conn.flush().await {
            match e {
                ProtocolError::ConnectionClosed => debug!("Write interrupted by close"),
                ProtocolError::Timeout => {
                    warn!("{}", constants::ERR_WRITE_TIMEOUT);
                    global_metrics().connection_error();
                }
                e => {
                    warn!(error = %e, "Write failed, closing connection");
                    global_metrics().connection_error();
                }
            }
            conn.close();
            break;
        }

        if conn.inner.close_after_flush.load(Ordering::Acquire) && conn.inner.send.is_empty() {
            debug!("Send buffer flushed, closing as requested");
            conn.close();
            break;
        }
    }

    conn.mark_close_requested();
    if let Some(mut writer) = conn.inner.writer.lock().await.take() {
        let deadline = conn.config().write_timeout;
        if let Ok(Err(e)) = tokio::time::timeout(deadline, writer.shutdown()).await {
            debug!(error = %e, "Transport shutdown failed");
        }
    }
    debug!("Stopped writing");
}

/// Periodically wake the writer until the send side closes.
async fn schedule_loop(conn: Connection) {
    let mut ticker = tokio::time::interval(conn.config().flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if conn.close_requested() {
            conn.close_send_signal();
            break;
        }
        conn.signal_send();

        tokio::select! {
            _ = conn.inner.shutdown.cancelled() => {}
            _ = ticker.tick() => {}
        }
    }
    debug!("Stopped scheduling");
}
