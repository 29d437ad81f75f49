//! Device configuration sequencer
//!
//! One worker task runs at most one sequence at a time. Every `start_*`
//! operation is non-blocking: it either launches the sequence or returns
//! [`SequenceError::Busy`] without disturbing the one in flight.
//! Completion is observed by polling [`ConfigSequencer::is_running`] and
//! then taking the result; progress and per-step reports arrive on the
//! event stream while the worker runs.

mod configure;
mod precheck;
mod readback;
mod scan;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use devcfg_core::{
    DeviceIdentity, InterfaceKind, NetworkModel, SequencerEvent, StepReport,
    TargetDeviceConfiguration,
};

use crate::config::EngineConfig;
use crate::error::SequenceError;
use crate::legacy::LegacyDriver;
use crate::modern::ModernProtocol;
use crate::transport::CanDriver;

/// Terminal output of a finished sequence.
#[derive(Debug, PartialEq)]
pub enum SequenceOutput {
    /// Devices are held in flashloader mode.
    EnteredFlashloader,
    /// Scan or read-back results.
    Identities(Vec<DeviceIdentity>),
    /// All target configurations written.
    Configured,
}

/// Parameters of the enter-flashloader sequence.
#[derive(Debug, Clone)]
pub struct EnterFlashloaderOptions {
    /// Transport the scan runs on; CAN gets its bitrate initialized first.
    pub transport: InterfaceKind,
    /// Send the modern broadcasts. Skip when no modern device is expected.
    pub include_modern: bool,
    /// Send the legacy reset and flash pulses.
    pub include_legacy: bool,
    /// Device-specific minimum wait; the keep-alive loop runs for at
    /// least this long or the configured default scan time, whichever is
    /// longer.
    pub minimum_wait: Duration,
}

impl Default for EnterFlashloaderOptions {
    fn default() -> Self {
        Self {
            transport: InterfaceKind::Can,
            include_modern: true,
            include_legacy: true,
            minimum_wait: Duration::ZERO,
        }
    }
}

/// Everything a running sequence needs, shared with the worker task.
pub(crate) struct SequencerCtx {
    pub config: EngineConfig,
    pub can: Arc<dyn CanDriver>,
    pub legacy: LegacyDriver,
    pub modern: Arc<dyn ModernProtocol>,
    pub topology: Arc<dyn NetworkModel>,
    pub events: broadcast::Sender<SequencerEvent>,
    /// Extends the keep-alive loop past its deadline while set.
    pub keep_scanning: AtomicBool,
    /// Set from the worker once the CAN transport has been initialized;
    /// read from the caller's context.
    pub can_initialized: Mutex<bool>,
}

impl SequencerCtx {
    pub(crate) fn emit_progress(&self, percent: u8) {
        let _ = self.events.send(SequencerEvent::Progress(percent));
    }

    pub(crate) fn emit_step(&self, report: StepReport) {
        let _ = self.events.send(SequencerEvent::Step(report));
    }
}

/// The sequencer: owns the worker slot and the drivers.
pub struct ConfigSequencer {
    ctx: Arc<SequencerCtx>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    result: Arc<Mutex<Option<Result<SequenceOutput, SequenceError>>>>,
}

impl ConfigSequencer {
    pub fn new(
        config: EngineConfig,
        can: Arc<dyn CanDriver>,
        modern: Arc<dyn ModernProtocol>,
        topology: Arc<dyn NetworkModel>,
    ) -> Self {
        let legacy = LegacyDriver::new(can.clone(), config.request_timeout());
        let (events, _) = broadcast::channel(256);
        Self {
            ctx: Arc::new(SequencerCtx {
                config,
                can,
                legacy,
                modern,
                topology,
                events,
                keep_scanning: AtomicBool::new(false),
                can_initialized: Mutex::new(false),
            }),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// Progress and step events of running sequences. Events are emitted
    /// from the worker context.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.ctx.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Take the terminal result of the last finished sequence, once.
    pub fn take_result(&self) -> Option<Result<SequenceOutput, SequenceError>> {
        self.result.lock().take()
    }

    /// Whether the worker has initialized the CAN transport.
    pub fn can_initialized(&self) -> bool {
        *self.ctx.can_initialized.lock()
    }

    /// Extend (or stop extending) the keep-alive loop. Checked once per
    /// loop iteration.
    pub fn set_keep_scanning(&self, keep: bool) {
        self.ctx.keep_scanning.store(keep, Ordering::SeqCst);
    }

    /// Wake devices into flashloader mode and hold them there with the
    /// keep-alive loop.
    pub fn start_enter_flashloader(
        &self,
        options: EnterFlashloaderOptions,
    ) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move { scan::run_enter_flashloader(&ctx, options).await })
    }

    /// Collect legacy device identities across the local-id space.
    pub fn start_scan_legacy(&self) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move { scan::run_scan_legacy(&ctx).await })
    }

    /// Collect modern device identities on one CAN bus.
    pub fn start_scan_modern_can(&self, bus_id: u8) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move { scan::run_scan_modern_can(&ctx, bus_id).await })
    }

    /// Collect modern device identities over Ethernet.
    pub fn start_scan_modern_ethernet(&self) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move { scan::run_scan_modern_ethernet(&ctx).await })
    }

    /// Validate the targets against the topology, then write node ids,
    /// bitrates and IP addresses. Nothing is written if validation fails.
    pub fn start_configure(
        &self,
        targets: Vec<TargetDeviceConfiguration>,
        configure_all_interfaces: bool,
    ) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move {
            configure::run_configure(&ctx, &targets, configure_all_interfaces).await
        })
    }

    /// Reconnect to every configured device at its new address and re-read
    /// its identity.
    pub fn start_read_back(
        &self,
        targets: Vec<TargetDeviceConfiguration>,
    ) -> Result<(), SequenceError> {
        self.launch(move |ctx| async move { readback::run_read_back(&ctx, &targets).await })
    }

    fn launch<F, Fut>(&self, sequence: F) -> Result<(), SequenceError>
    where
        F: FnOnce(Arc<SequencerCtx>) -> Fut,
        Fut: std::future::Future<Output = Result<SequenceOutput, SequenceError>> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SequenceError::Busy);
        }
        *self.result.lock() = None;

        let future = sequence(self.ctx.clone());
        let running = self.running.clone();
        let result = self.result.clone();
        let handle = tokio::spawn(async move {
            let outcome = future.await;
            if let Err(e) = &outcome {
                warn!(%e, "sequence failed");
            }
            *result.lock() = Some(outcome);
            running.store(false, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }
}

impl Drop for ConfigSequencer {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
