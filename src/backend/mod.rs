//! Event-loop wiring for running on real hardware
//!
//! Everything runs on one calloop [`EventLoop`]:
//!
//! - the DRM fd (page-flip completions), disabled while the seat is away
//! - an idle callback per armed output, which runs the repaint handler
//! - the libseat notifier, whose events become session events
//! - a udev monitor for connector hotplug
//! - the demo client's timer
//!
//! Ctrl+C stops the loop; the compositor is then suspended and torn down,
//! and the device node goes back to the seat it came from.

pub mod drm;
pub mod hotplug;

use std::time::Duration;

use anyhow::{Context, Result};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use log::{debug, error, info, trace, warn};

use crate::compositor::Compositor;
use crate::config::KmsConfig;
use crate::demo::DemoClient;
use crate::device::DeviceSession;
use crate::output::OutputId;
use crate::renderer::software::{canvas_store, SoftwareRenderer};
use crate::scheduler::IdleTrigger;
use crate::session::{release_device, SeatSession, Session, SessionEvent};
use self::drm::DrmCard;
use self::hotplug::{HotplugEvent, HotplugMonitor};

/// The compositor type the binary runs
pub type KmsCompositor = Compositor<DrmCard, SoftwareRenderer, LoopIdleTrigger>;

/// Runs the repaint handler from a calloop idle callback
///
/// Idle callbacks run once, right before the loop would block again, so
/// every commit that arrives in the same dispatch shares a single frame.
pub struct LoopIdleTrigger {
    handle: LoopHandle<'static, State>,
}

impl IdleTrigger for LoopIdleTrigger {
    fn arm(&mut self, output: OutputId) {
        self.handle
            .insert_idle(move |state: &mut State| state.compositor.run_repaint(output));
    }
}

/// Event-loop state
pub struct State {
    pub compositor: KmsCompositor,
    handle: LoopHandle<'static, State>,
    signal: LoopSignal,
    drm_source: RegistrationToken,
    demo: Option<DemoClient>,
}

impl State {
    fn handle_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Disabled => {
                info!("⏸️ Session disabled");
                if let Err(err) = self.compositor.suspend() {
                    warn!("suspend failed: {}", err);
                }
                if let Err(err) = self.handle.disable(&self.drm_source) {
                    warn!("disabling the DRM event source failed: {}", err);
                }
            }
            SessionEvent::Enabled => {
                info!("▶️ Session enabled");
                match self.compositor.resume() {
                    Ok(report) if report.reregister_event_source => {
                        if let Err(err) = self.handle.enable(&self.drm_source) {
                            error!("re-enabling the DRM event source failed: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => error!("resume failed: {}", err),
                }
            }
        }
    }

    fn handle_hotplug(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Changed => match self.compositor.handle_hotplug() {
                Ok(changes) if changes.is_empty() => trace!("hotplug event without changes"),
                Ok(_) => {}
                Err(err) => warn!("connector rescan failed: {}", err),
            },
            HotplugEvent::Removed => {
                self.compositor.handle_device_removed();
                error!("❌ Graphics device removed, shutting down");
                self.signal.stop();
            }
        }
    }

    /// Runs after every dispatch: hands released frame callbacks to clients
    fn after_dispatch(&mut self) {
        let done = self.compositor.drain_frame_done();
        if done.is_empty() {
            return;
        }
        trace!("{} frame callback(s) done", done.len());
        if let Some(demo) = self.demo.as_mut() {
            demo.frame_done(&done);
        }
    }
}

/// Brings up the device and runs until Ctrl+C or device removal
pub fn run(config: &KmsConfig) -> Result<()> {
    let (mut session, notifier) = SeatSession::open().context("Failed to open a seat")?;
    let fd = session
        .open_device(&config.device.path)
        .with_context(|| format!("Failed to open {}", config.device.path.display()))?;

    let canvases = canvas_store();
    let card = DrmCard::new(fd, canvases.clone()).context("Failed to initialize DRM device")?;
    let drm_fd = card
        .fd()
        .try_clone_to_owned()
        .context("Failed to duplicate DRM fd")?;
    let device = DeviceSession::new(
        card,
        config.scanout.max_outputs,
        config.scanout.suspend_drain_timeout(),
    );

    let mut event_loop: EventLoop<'static, State> =
        EventLoop::try_new().context("Failed to create event loop")?;
    let handle = event_loop.handle();
    let signal = event_loop.get_signal();

    let trigger = LoopIdleTrigger {
        handle: handle.clone(),
    };
    let mut compositor = Compositor::new(
        device,
        SoftwareRenderer::new(canvases),
        trigger,
        config.render_options(),
    );
    let outputs = compositor
        .init()
        .context("Failed to bring up any display")?;
    info!("🖥️ {} output(s) ready", outputs.len());

    let drm_source = handle
        .insert_source(
            Generic::new(drm_fd, Interest::READ, Mode::Level),
            |_, _, state: &mut State| {
                if let Err(err) = state.compositor.dispatch_kernel_events() {
                    warn!("reading DRM events failed: {}", err);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| err.error)
        .context("Failed to insert DRM source")?;

    handle
        .insert_source(notifier, |event, &mut (), state: &mut State| {
            state.handle_session(SessionEvent::from(event));
        })
        .map_err(|err| err.error)
        .context("Failed to insert seat source")?;

    if config.device.hotplug {
        match HotplugMonitor::new(&config.device.path) {
            Ok(mut monitor) => {
                let fd = monitor.fd().context("Failed to duplicate udev fd")?;
                handle
                    .insert_source(
                        Generic::new(fd, Interest::READ, Mode::Level),
                        move |_, _, state: &mut State| {
                            if let Some(event) = monitor.poll() {
                                state.handle_hotplug(event);
                            }
                            Ok(PostAction::Continue)
                        },
                    )
                    .map_err(|err| err.error)
                    .context("Failed to insert udev source")?;
            }
            Err(err) => warn!("⚠️ Hotplug disabled, udev monitor unavailable: {}", err),
        }
    }

    let demo = if config.demo.enabled {
        let client = DemoClient::spawn(&mut compositor, config.demo.surfaces)
            .context("Failed to start demo client")?;
        let interval = Duration::from_millis(config.demo.interval_ms);
        handle
            .insert_source(Timer::from_duration(interval), move |_, _, state: &mut State| {
                if let Some(demo) = state.demo.as_mut() {
                    if let Err(err) = demo.tick(&mut state.compositor) {
                        warn!("demo frame failed: {}", err);
                    }
                }
                TimeoutAction::ToDuration(interval)
            })
            .map_err(|err| err.error)
            .context("Failed to insert demo timer")?;
        Some(client)
    } else {
        None
    };

    let stop = signal.clone();
    ctrlc::set_handler(move || stop.stop()).context("Failed to install Ctrl+C handler")?;

    let mut state = State {
        compositor,
        handle,
        signal,
        drm_source,
        demo,
    };

    info!("✨ Scanout running, press Ctrl+C to quit");
    event_loop
        .run(None, &mut state, State::after_dispatch)
        .context("Event loop failed")?;

    info!("👋 Shutting down");
    if let Some(demo) = state.demo.take() {
        demo.destroy(&mut state.compositor);
    }
    state.compositor.shutdown();
    debug!("scanout resources released");

    let card = state.compositor.into_device().into_backend();
    release_device(&mut session, &config.device.path, card.into_fd());
    Ok(())
}
