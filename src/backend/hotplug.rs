//! udev hotplug monitor for DRM devices
//!
//! Connector plug/unplug shows up as a `change` uevent on the card device
//! with `HOTPLUG=1`; removal of the card itself is a `remove` uevent.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use udev::{EventType, MonitorBuilder, MonitorSocket};

/// What a batch of uevents means for the card we drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// Connectors may have changed; rescan them
    Changed,
    /// The card node went away
    Removed,
}

/// Watches the `drm` subsystem for one device node
pub struct HotplugMonitor {
    socket: MonitorSocket,
    devnode: PathBuf,
}

impl HotplugMonitor {
    /// Starts listening for uevents on `devnode` (e.g. `/dev/dri/card0`)
    pub fn new(devnode: &Path) -> io::Result<Self> {
        let socket = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
        debug!("watching udev for {}", devnode.display());
        Ok(Self {
            socket,
            devnode: devnode.to_path_buf(),
        })
    }

    /// A duplicate of the monitor fd, for registering with an event loop
    pub fn fd(&self) -> io::Result<OwnedFd> {
        self.socket.as_fd().try_clone_to_owned()
    }

    /// Drains pending uevents and folds them into a single event
    pub fn poll(&mut self) -> Option<HotplugEvent> {
        let mut result = None;
        for event in self.socket.iter() {
            let Some(devnode) = event.devnode() else {
                continue;
            };
            if devnode != self.devnode.as_path() {
                continue;
            }

            trace!("uevent {:?} on {}", event.event_type(), devnode.display());
            let kind = classify(event.event_type(), event.property_value("HOTPLUG").is_some());
            result = merge(result, kind);
        }
        result
    }
}

fn classify(event_type: EventType, hotplug: bool) -> Option<HotplugEvent> {
    match event_type {
        EventType::Remove => Some(HotplugEvent::Removed),
        EventType::Change if hotplug => Some(HotplugEvent::Changed),
        EventType::Add => Some(HotplugEvent::Changed),
        _ => None,
    }
}

/// Removal wins over any change seen in the same batch
fn merge(current: Option<HotplugEvent>, next: Option<HotplugEvent>) -> Option<HotplugEvent> {
    match (current, next) {
        (Some(HotplugEvent::Removed), _) | (_, Some(HotplugEvent::Removed)) => {
            Some(HotplugEvent::Removed)
        }
        (Some(event), _) | (None, Some(event)) => Some(event),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_monitor_fd_is_a_separate_duplicate() {
        // Sandboxes without a netlink socket cannot run this.
        let Ok(monitor) = HotplugMonitor::new(Path::new("/dev/dri/card0")) else {
            return;
        };
        let fd = monitor.fd().unwrap();
        assert_ne!(fd.as_raw_fd(), monitor.socket.as_fd().as_raw_fd());

        drop(fd);
        assert!(monitor.fd().is_ok());
    }

    #[test]
    fn test_classify_uevents() {
        assert_eq!(
            classify(EventType::Change, true),
            Some(HotplugEvent::Changed)
        );
        assert_eq!(classify(EventType::Change, false), None);
        assert_eq!(
            classify(EventType::Remove, false),
            Some(HotplugEvent::Removed)
        );
    }

    #[test]
    fn test_removal_dominates_batch() {
        let batch = [
            Some(HotplugEvent::Changed),
            Some(HotplugEvent::Removed),
            Some(HotplugEvent::Changed),
        ];
        let folded = batch.into_iter().fold(None, merge);
        assert_eq!(folded, Some(HotplugEvent::Removed));

        assert_eq!(merge(None, None), None);
        assert_eq!(
            merge(None, Some(HotplugEvent::Changed)),
            Some(HotplugEvent::Changed)
        );
    }
}
