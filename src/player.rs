/// Sequence playback
///
/// Step mode queues one entry immediately. Auto mode runs the inter-entry
/// timing on a worker thread and hands each entry back over a channel; the
/// thread that owns the dispatcher turns events into joint updates, so the
/// dispatcher is never touched from the worker.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::joints::Joint;
use crate::sequence::{SequenceEntry, SequenceStore};

pub const DEFAULT_AUTO_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlayError {
    #[error("Nothing to play: the command list is empty or no command is selected")]
    NothingToPlay,
    #[error("Delay must be a whole number of milliseconds, got {0:?}")]
    InvalidDelay(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Parse the delay field text.
pub fn parse_delay_ms(text: &str) -> Result<Duration, PlayError> {
    text.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| PlayError::InvalidDelay(text.to_string()))
}

/// Queue the four joint updates of `entry`, joint 1 first.
pub fn play_entry(entry: &SequenceEntry, dispatcher: &mut CommandDispatcher) -> Result<(), PlayError> {
    if !dispatcher.is_connected() {
        return Err(DispatchError::LinkNotReady.into());
    }
    for joint in Joint::ALL {
        let state = entry.state(joint);
        dispatcher.request_joint(joint, state.angle, state.speed)?;
    }
    Ok(())
}

/// Play the selected entry. Returns the index that was played.
pub fn play_step(
    store: &SequenceStore,
    selection: Option<usize>,
    dispatcher: &mut CommandDispatcher,
) -> Result<usize, PlayError> {
    let index = selection.ok_or(PlayError::NothingToPlay)?;
    let entry = store.get(index).ok_or(PlayError::NothingToPlay)?;
    play_entry(entry, dispatcher)?;
    info!(target: "player", "Played command {}", index + 1);
    Ok(index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Time to play this entry.
    Entry { index: usize, entry: SequenceEntry },
    Finished { played: usize },
    Cancelled { played: usize },
}

/// Handle to a running auto playback. Dropping it cancels the playback.
#[derive(Debug)]
pub struct AutoPlayback {
    events: Receiver<PlaybackEvent>,
    cancel_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    total: usize,
}

impl AutoPlayback {
    /// Start playing every entry of `store` in order, `delay` apart.
    ///
    /// The entries are copied, so later edits to the store do not affect a
    /// playback in progress.
    pub fn start(store: &SequenceStore, delay: Duration) -> Result<Self, PlayError> {
        if store.is_empty() {
            return Err(PlayError::NothingToPlay);
        }
        let entries: Vec<SequenceEntry> = store.entries().to_vec();
        let total = entries.len();
        let (event_tx, events) = unbounded();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        info!(target: "player", "Auto playback of {} command(s), {} ms apart", total, delay.as_millis());
        let worker = thread::spawn(move || {
            let mut played = 0;
            for (index, entry) in entries.into_iter().enumerate() {
                let wait = if index == 0 { Duration::ZERO } else { delay };
                match cancel_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(target: "player", "Auto playback cancelled after {} command(s)", played);
                        let _ = event_tx.send(PlaybackEvent::Cancelled { played });
                        return;
                    }
                }
                if event_tx.send(PlaybackEvent::Entry { index, entry }).is_err() {
                    return;
                }
                played += 1;
            }
            let _ = event_tx.send(PlaybackEvent::Finished { played });
        });

        Ok(Self {
            events,
            cancel_tx: Some(cancel_tx),
            worker: Some(worker),
            total,
        })
    }

    pub fn events(&self) -> &Receiver<PlaybackEvent> {
        &self.events
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Stop before the next entry. The worker reports `Cancelled` unless it already finished.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for AutoPlayback {
    fn drop(&mut self) {
        self.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherSettings;
    use crate::serial_link::{link_test_guard, MemoryPort};
    use std::sync::MutexGuard;
    use std::time::Instant;

    fn store() -> SequenceStore {
        SequenceStore::from_entries(vec![
            SequenceEntry { angles: [10, 20, 30, 40], speeds: [1, 2, 3, 4] },
            SequenceEntry { angles: [50, 60, 70, 80], speeds: [5, 6, 7, 8] },
            SequenceEntry { angles: [90, 100, 110, 120], speeds: [9, 10, 11, 12] },
        ])
    }

    fn connected(name: &str) -> (MutexGuard<'static, ()>, CommandDispatcher, MemoryPort) {
        let serial = link_test_guard();
        let port = MemoryPort::new();
        let mut dispatcher = CommandDispatcher::new(DispatcherSettings::default());
        dispatcher.attach(name, Box::new(port.clone())).unwrap();
        (serial, dispatcher, port)
    }

    fn drain(dispatcher: &mut CommandDispatcher) {
        while dispatcher.pending() > 0 {
            dispatcher.tick();
        }
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay_ms("500"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_delay_ms(" 0 "), Ok(Duration::ZERO));
        assert_eq!(parse_delay_ms("half"), Err(PlayError::InvalidDelay("half".into())));
        assert_eq!(parse_delay_ms("-1"), Err(PlayError::InvalidDelay("-1".into())));
    }

    #[test]
    fn test_step_plays_four_updates_in_joint_order() {
        let (_serial, mut dispatcher, port) = connected("mem-player-step");
        assert_eq!(play_step(&store(), Some(1), &mut dispatcher), Ok(1));
        assert_eq!(dispatcher.pending(), 4);
        drain(&mut dispatcher);
        assert_eq!(port.frames(), vec!["1,50,5", "2,60,6", "3,70,7", "4,80,8"]);
    }

    #[test]
    fn test_step_without_selection_is_nothing_to_play() {
        let (_serial, mut dispatcher, _port) = connected("mem-player-nothing");
        assert_eq!(play_step(&store(), None, &mut dispatcher), Err(PlayError::NothingToPlay));
        assert_eq!(play_step(&store(), Some(3), &mut dispatcher), Err(PlayError::NothingToPlay));
        assert_eq!(play_step(&SequenceStore::new(), Some(0), &mut dispatcher), Err(PlayError::NothingToPlay));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_step_with_closed_link_queues_nothing() {
        let mut dispatcher = CommandDispatcher::new(DispatcherSettings::default());
        assert_eq!(
            play_step(&store(), Some(0), &mut dispatcher),
            Err(PlayError::Dispatch(DispatchError::LinkNotReady))
        );
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_auto_with_empty_store_is_nothing_to_play() {
        assert!(matches!(
            AutoPlayback::start(&SequenceStore::new(), DEFAULT_AUTO_DELAY),
            Err(PlayError::NothingToPlay)
        ));
    }

    #[test]
    fn test_auto_plays_every_entry_in_order_with_delay() {
        let delay = Duration::from_millis(30);
        let (_serial, mut dispatcher, port) = connected("mem-player-auto");
        let started = Instant::now();
        let playback = AutoPlayback::start(&store(), delay).unwrap();
        let mut arrivals = Vec::new();
        let mut indices = Vec::new();

        loop {
            match playback.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                PlaybackEvent::Entry { index, entry } => {
                    arrivals.push(Instant::now());
                    indices.push(index);
                    play_entry(&entry, &mut dispatcher).unwrap();
                    drain(&mut dispatcher);
                }
                PlaybackEvent::Finished { played } => {
                    assert_eq!(played, 3);
                    break;
                }
                PlaybackEvent::Cancelled { .. } => panic!("playback should not be cancelled"),
            }
        }

        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(port.frames().len(), 12);
        assert_eq!(port.frames()[4], "1,50,5");
        assert_eq!(port.frames()[11], "4,120,12");
        assert!(arrivals[2].duration_since(started) >= delay * 2);
        for pair in arrivals.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay - Duration::from_millis(10));
        }
    }

    #[test]
    fn test_cancel_stops_before_next_entry() {
        let mut playback = AutoPlayback::start(&store(), Duration::from_secs(10)).unwrap();
        assert!(matches!(
            playback.events().recv_timeout(Duration::from_secs(5)),
            Ok(PlaybackEvent::Entry { index: 0, .. })
        ));
        playback.cancel();
        assert_eq!(
            playback.events().recv_timeout(Duration::from_secs(5)),
            Ok(PlaybackEvent::Cancelled { played: 1 })
        );
    }

    #[test]
    fn test_playback_copies_entries() {
        let mut source = store();
        let playback = AutoPlayback::start(&source, Duration::ZERO).unwrap();
        source.delete(0);
        let mut seen = 0;
        while let Ok(event) = playback.events().recv_timeout(Duration::from_secs(5)) {
            match event {
                PlaybackEvent::Entry { .. } => seen += 1,
                _ => break,
            }
        }
        assert_eq!(seen, 3);
        assert_eq!(playback.total(), 3);
    }
}
