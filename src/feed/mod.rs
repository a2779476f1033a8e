//! Per-filter publish fanout
//!
//! A [`Feed`] broadcasts one event to every currently subscribed receiver
//! channel while tolerating concurrent subscribe and unsubscribe. Newly
//! subscribed channels sit in a pending set until the next publish
//! integrates them; the active set and the delivery loop are guarded by a
//! single send permit (an async mutex), and unsubscribers that find the
//! permit taken hand their removal to the in-progress publisher over an
//! interrupt channel instead of blocking on it.
//!
//! Delivery never lets one slow receiver stall the rest: each round first
//! try-sends to every ready channel, then parks on a multi-way select over
//! the remaining reservations plus the cancel and interrupt cases.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::select_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

use crate::protocol::Publish;

/// A publish event delivered to subscribers.
///
/// The topic here is the feed's filter, which is not necessarily the topic
/// in the raw packet when the subscriber used wildcards; the concrete topic
/// travels inside the packet.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    /// The filter of the feed that delivered this event
    pub filter: Arc<str>,
    /// The PUBLISH packet being fanned out
    pub packet: Arc<Publish>,
}

/// Subscriber channel handle
pub type EventSender = mpsc::Sender<PublishEvent>;

/// State guarded by the send permit: the active set plus the receiving end
/// of the interrupt channel.
struct FanoutState {
    active: Vec<EventSender>,
    remove_rx: mpsc::UnboundedReceiver<EventSender>,
}

/// Fanout primitive for a single topic filter.
///
/// Created by the topic index on first subscribe to a filter; sessions hold
/// it only weakly through their [`Subscription`] handles.
pub struct Feed {
    /// The filter string, kept for logging and event tagging
    filter: Arc<str>,
    /// Send permit: at most one publisher (or direct remover) at a time
    send_permit: AsyncMutex<FanoutState>,
    /// Channels subscribed since the last publish
    pending: Mutex<Vec<EventSender>>,
    /// Hand-off for removals while a publish holds the permit
    remove_tx: mpsc::UnboundedSender<EventSender>,
}

impl Feed {
    pub fn new(filter: &str) -> Self {
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        Self {
            filter: Arc::from(filter),
            send_permit: AsyncMutex::new(FanoutState {
                active: Vec::new(),
                remove_rx,
            }),
            pending: Mutex::new(Vec::new()),
            remove_tx,
        }
    }

    /// The filter this feed fans out for
    pub fn filter(&self) -> &Arc<str> {
        &self.filter
    }

    /// Attach a receiver channel.
    ///
    /// The channel joins the pending set and starts receiving events at the
    /// next publish. The returned handle supports once-only unsubscription.
    pub fn subscribe(self: &Arc<Self>, channel: EventSender) -> Subscription {
        self.pending.lock().push(channel.clone());
        Subscription {
            feed: Arc::downgrade(self),
            channel,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// Deliver one event to every subscribed channel.
    ///
    /// Ready channels are drained with non-blocking sends first; the rest
    /// are awaited through a multi-way select that also services removal
    /// interrupts and the cancel signal. Returns the number of deliveries,
    /// which is partial when `cancel` fires mid-publish.
    pub async fn publish(
        &self,
        cancel: &mut broadcast::Receiver<()>,
        event: PublishEvent,
    ) -> usize {
        let mut state = self.send_permit.lock().await;
        let FanoutState { active, remove_rx } = &mut *state;

        // removals requested between publishes, before integrating pending
        while let Ok(channel) = remove_rx.try_recv() {
            remove_channel(active, &channel);
        }

        {
            let mut pending = self.pending.lock();
            active.append(&mut *pending);
        }

        let mut working: Vec<EventSender> = active.clone();
        let mut delivered = 0usize;

        loop {
            // fast path: everyone who can receive right now
            let mut i = 0;
            while i < working.len() {
                match working[i].try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        working.swap_remove(i);
                    }
                    Err(TrySendError::Closed(_)) => {
                        // receiver dropped without unsubscribing
                        working.swap_remove(i);
                    }
                    Err(TrySendError::Full(_)) => i += 1,
                }
            }

            if working.is_empty() {
                break;
            }

            enum Wake {
                Cancelled,
                Remove(Option<EventSender>),
                SlotReady(usize, bool),
            }

            let wake = {
                let reservations = select_all(working.iter().map(|tx| Box::pin(tx.reserve())));
                tokio::select! {
                    _ = cancel.recv() => Wake::Cancelled,
                    removed = remove_rx.recv() => Wake::Remove(removed),
                    (slot, index, _) = reservations => match slot {
                        Ok(permit) => {
                            permit.send(event.clone());
                            Wake::SlotReady(index, true)
                        }
                        Err(_) => Wake::SlotReady(index, false),
                    },
                }
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Remove(Some(channel)) => {
                    remove_channel(active, &channel);
                    remove_channel(&mut working, &channel);
                }
                // the interrupt sender lives in self, so the channel
                // cannot actually close while the feed is alive
                Wake::Remove(None) => break,
                Wake::SlotReady(index, sent) => {
                    if sent {
                        delivered += 1;
                    }
                    working.swap_remove(index);
                }
            }
        }

        delivered
    }

    /// Detach a channel; called through [`Subscription::unsubscribe`].
    async fn remove(&self, channel: &EventSender) {
        // if still pending, delete there first
        {
            let mut pending = self.pending.lock();
            if let Some(i) = pending.iter().position(|c| c.same_channel(channel)) {
                pending.swap_remove(i);
                return;
            }
        }

        // otherwise, whichever is ready first: the permit for a direct
        // removal, or the interrupt channel when a publisher holds it
        tokio::select! {
            biased;
            mut state = self.send_permit.lock() => {
                remove_channel(&mut state.active, channel);
            }
            _ = async { let _ = self.remove_tx.send(channel.clone()); } => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub(crate) async fn active_len(&self) -> usize {
        self.send_permit.lock().await.active.len()
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed").field("filter", &self.filter).finish()
    }
}

fn remove_channel(channels: &mut Vec<EventSender>, channel: &EventSender) {
    if let Some(i) = channels.iter().position(|c| c.same_channel(channel)) {
        channels.swap_remove(i);
    }
}

/// Handle joining one subscriber channel to one feed.
///
/// Holds the feed weakly so a dangling subscription cannot keep a feed
/// alive after the topic index removed it.
pub struct Subscription {
    feed: Weak<Feed>,
    channel: EventSender,
    unsubscribed: AtomicBool,
}

impl Subscription {
    /// Detach the channel from the feed. Idempotent: only the first call
    /// performs the removal.
    pub async fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(&self.channel).await;
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("unsubscribed", &self.unsubscribed.load(Ordering::Relaxed))
            .finish()
    }
}
