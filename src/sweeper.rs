use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::*;

/// A background thread that periodically finalizes stripes which
/// filled up since its last pass.
#[derive(Debug)]
pub(crate) struct Sweeper {
    shutdown_tx: Sender<Sender<()>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn new(
        name: String,
        wb_stripe_manager: Arc<WbStripeManager>,
        sweep_every_ms: u64,
    ) -> Result<Sweeper> {
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let join_handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(&shutdown_rx, &wb_stripe_manager, sweep_every_ms))?;

        Ok(Sweeper { shutdown_tx, join_handle: Some(join_handle) })
    }
}

fn run(
    shutdown_rx: &Receiver<Sender<()>>,
    wb_stripe_manager: &WbStripeManager,
    sweep_every_ms: u64,
) {
    let sweep_every = Duration::from_millis(sweep_every_ms);
    loop {
        match shutdown_rx.recv_timeout(sweep_every) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(ack_tx) => {
                let _ = ack_tx.send(());
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }

        // failed stripes are requeued, so the next pass retries them
        if let Err(e) = wb_stripe_manager.flush_pending_active_stripes() {
            log::error!("failed to sweep pending stripes from periodic sweeper: {}", e);
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.shutdown_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.recv();
        }

        if let Some(join_handle) = self.join_handle.take() {
            if let Err(e) = join_handle.join() {
                log::error!("error joining sweeper thread: {:?}", e);
            }
        }
    }
}
