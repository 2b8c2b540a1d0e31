//! Full-page bitmaps shared by every section of a page

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::debug;

use super::canvas::CanvasObject;
use super::document::{SharedResult, Viewport};
use super::reference::{Reference, ReferenceId, ReferenceManager};
use super::request::RenderError;
use super::scheduler::{Scheduler, TimerId};

/// Who holds the primary slot of a [`MainCanvas`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MainClaim {
    Unclaimed,
    ClaimedBy(ReferenceId),
}

/// Callback run when a main canvas's grace period expires
pub type EvictFn = Rc<dyn Fn(&Rc<MainCanvas>)>;

/// One page rendered once at one scale.
///
/// The primary consumer (the claim holder) draws the canvas directly; any
/// other consumer receives a cropped copy. The entry is evicted once its
/// reference count has stayed at zero for the grace period.
pub struct MainCanvas {
    page: u32,
    scale: f64,
    canvas: CanvasObject,
    references: ReferenceManager,
    claim: Cell<MainClaim>,
    size: SharedResult<Viewport>,
    rendered: SharedResult<(), RenderError>,
    eviction: Cell<Option<TimerId>>,
    evicted: Cell<bool>,
}

impl MainCanvas {
    pub(crate) fn new(
        page: u32,
        scale: f64,
        canvas: CanvasObject,
        references: ReferenceManager,
        size: SharedResult<Viewport>,
        rendered: SharedResult<(), RenderError>,
    ) -> Self {
        Self {
            page,
            scale,
            canvas,
            references,
            claim: Cell::new(MainClaim::Unclaimed),
            size,
            rendered,
            eviction: Cell::new(None),
            evicted: Cell::new(false),
        }
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Scale the page was rendered at
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[must_use]
    pub fn canvas(&self) -> &CanvasObject {
        &self.canvas
    }

    #[must_use]
    pub fn references(&self) -> &ReferenceManager {
        &self.references
    }

    #[must_use]
    pub fn claim_state(&self) -> MainClaim {
        self.claim.get()
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claim.get() != MainClaim::Unclaimed
    }

    /// Resolves with the page size at this entry's scale once the page has loaded
    #[must_use]
    pub fn size(&self) -> SharedResult<Viewport> {
        self.size.clone()
    }

    /// Resolves once the page has been drawn into the canvas
    #[must_use]
    pub fn rendered(&self) -> SharedResult<(), RenderError> {
        self.rendered.clone()
    }

    /// Whether an eviction is currently scheduled
    #[must_use]
    pub fn eviction_pending(&self) -> bool {
        self.eviction.get().is_some()
    }

    /// True once the grace period expired and the canvas went back to the pool
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.get()
    }

    /// Whether this entry can serve a request at `scale`.
    ///
    /// Entries rendered at the same or a higher scale qualify; a lower-scale
    /// entry is never stretched up.
    #[must_use]
    pub fn serves(&self, scale: f64, tolerance: f64) -> bool {
        !self.evicted.get() && self.scale >= scale - tolerance
    }

    /// Make `reference` the primary consumer.
    ///
    /// Returns false if the slot is already held. The slot frees itself when
    /// `reference` is released.
    pub fn claim(self: &Rc<Self>, reference: &Reference) -> bool {
        if self.is_claimed() {
            return false;
        }

        let id = reference.id();
        self.claim.set(MainClaim::ClaimedBy(id));
        let entry = Rc::downgrade(self);
        reference.on_release(move || {
            if let Some(entry) = entry.upgrade() {
                if entry.claim.get() == MainClaim::ClaimedBy(id) {
                    entry.claim.set(MainClaim::Unclaimed);
                }
            }
        });
        true
    }

    /// Schedule eviction whenever the count drops to zero, cancel it when it rises again
    pub(crate) fn watch_eviction(
        self: &Rc<Self>,
        scheduler: Rc<dyn Scheduler>,
        grace: Duration,
        on_evict: EvictFn,
    ) {
        let entry = Rc::downgrade(self);
        self.references.subscribe(move |count| {
            let Some(this) = entry.upgrade() else {
                return;
            };

            if count <= 0 {
                if this.eviction.get().is_none() && !this.evicted.get() {
                    let id = scheduler.schedule_after(
                        grace,
                        Box::new(expire(Weak::clone(&entry), Rc::clone(&on_evict))),
                    );
                    this.eviction.set(Some(id));
                    debug!(
                        "main canvas page={} scale={}: eviction in {grace:?}",
                        this.page, this.scale
                    );
                }
            } else if let Some(id) = this.eviction.take() {
                scheduler.cancel(id);
                debug!(
                    "main canvas page={} scale={}: eviction cancelled",
                    this.page, this.scale
                );
            }
        });
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.set(true);
    }
}

fn expire(entry: Weak<MainCanvas>, on_evict: EvictFn) -> impl FnOnce() {
    move || {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        entry.eviction.set(None);
        if entry.references.count() <= 0 && !entry.evicted.get() {
            on_evict(&entry);
        }
    }
}

impl fmt::Debug for MainCanvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainCanvas")
            .field("page", &self.page)
            .field("scale", &self.scale)
            .field("canvas", &self.canvas)
            .field("references", &self.references.count())
            .field("claim", &self.claim.get())
            .field("evicted", &self.evicted.get())
            .finish_non_exhaustive()
    }
}

/// Pick the entry that should serve a request at `scale`.
///
/// Among qualifying entries the first unclaimed one wins, so a new
/// requester can become the primary consumer of an existing bitmap;
/// otherwise the first qualifying entry is returned.
#[must_use]
pub fn find_main_canvas(
    entries: &[Rc<MainCanvas>],
    scale: f64,
    tolerance: f64,
) -> Option<Rc<MainCanvas>> {
    let mut qualifying = entries.iter().filter(|e| e.serves(scale, tolerance));
    let first = qualifying.next()?;
    if !first.is_claimed() {
        return Some(Rc::clone(first));
    }
    qualifying
        .find(|e| !e.is_claimed())
        .or(Some(first))
        .map(Rc::clone)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures::FutureExt;
    use futures::future;

    use super::*;
    use crate::pdf::canvas::CanvasPool;
    use crate::pdf::scheduler::TimerQueue;

    const GRACE: Duration = Duration::from_secs(10);

    fn entry(pool: &CanvasPool, scale: f64) -> Rc<MainCanvas> {
        let viewport = Viewport {
            width: 10.0 * scale,
            height: 10.0 * scale,
            scale,
        };
        Rc::new(MainCanvas::new(
            1,
            scale,
            pool.create(None).unwrap(),
            ReferenceManager::new(),
            future::ready(Ok(viewport)).boxed_local().shared(),
            future::ready(Ok(())).boxed_local().shared(),
        ))
    }

    fn watched(
        pool: &CanvasPool,
        queue: &Rc<TimerQueue>,
    ) -> (Rc<MainCanvas>, Rc<RefCell<Vec<u32>>>) {
        let entry = entry(pool, 1.0);
        let evicted = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&evicted);
        let scheduler: Rc<dyn Scheduler> = queue.clone();
        entry.watch_eviction(
            scheduler,
            GRACE,
            Rc::new(move |e: &Rc<MainCanvas>| {
                e.mark_evicted();
                sink.borrow_mut().push(e.page());
            }),
        );
        (entry, evicted)
    }

    #[test]
    fn higher_scale_serves_lower_request() {
        let pool = CanvasPool::new();
        let hi = entry(&pool, 2.0);
        assert!(hi.serves(1.5, 0.001));

        let lo = entry(&pool, 1.0);
        assert!(!lo.serves(1.5, 0.001));
        assert!(lo.serves(1.0005, 0.001));
    }

    #[test]
    fn find_prefers_unclaimed_entry() {
        let pool = CanvasPool::new();
        let claimed = entry(&pool, 1.0);
        let free = entry(&pool, 2.0);
        let reference = claimed.references().create_retained_ref();
        assert!(claimed.claim(&reference));

        let entries = vec![Rc::clone(&claimed), Rc::clone(&free)];
        let found = find_main_canvas(&entries, 1.0, 0.001).unwrap();
        assert!(Rc::ptr_eq(&found, &free));

        let other = free.references().create_retained_ref();
        assert!(free.claim(&other));
        let found = find_main_canvas(&entries, 1.0, 0.001).unwrap();
        assert!(Rc::ptr_eq(&found, &claimed));
    }

    #[test]
    fn find_returns_none_without_qualifying_entry() {
        let pool = CanvasPool::new();
        let entries = vec![entry(&pool, 1.0)];
        assert!(find_main_canvas(&entries, 1.5, 0.001).is_none());
    }

    #[test]
    fn claim_is_exclusive_and_freed_on_release() {
        let pool = CanvasPool::new();
        let entry = entry(&pool, 1.0);
        let first = entry.references().create_retained_ref();
        let second = entry.references().create_retained_ref();

        assert!(entry.claim(&first));
        assert!(!entry.claim(&second));
        assert_eq!(entry.claim_state(), MainClaim::ClaimedBy(first.id()));

        second.release();
        assert!(entry.is_claimed());
        first.release();
        assert_eq!(entry.claim_state(), MainClaim::Unclaimed);
    }

    #[test]
    fn eviction_fires_after_grace_period() {
        let pool = CanvasPool::new();
        let queue = Rc::new(TimerQueue::new());
        let (entry, evicted) = watched(&pool, &queue);

        entry.references().create_retained_ref().release();
        assert!(entry.eviction_pending());

        queue.advance(GRACE - Duration::from_millis(1));
        assert!(evicted.borrow().is_empty());
        queue.advance(Duration::from_millis(1));
        assert_eq!(*evicted.borrow(), vec![1]);
        assert!(entry.is_evicted());
        assert!(!entry.serves(1.0, 0.001));
    }

    #[test]
    fn new_claim_cancels_pending_eviction() {
        let pool = CanvasPool::new();
        let queue = Rc::new(TimerQueue::new());
        let (entry, evicted) = watched(&pool, &queue);

        entry.references().create_retained_ref().release();
        queue.advance(Duration::from_secs(5));
        let again = entry.references().create_retained_ref();
        assert!(!entry.eviction_pending());
        assert_eq!(queue.pending(), 0);

        queue.advance(Duration::from_secs(30));
        assert!(evicted.borrow().is_empty());
        drop(again);
        assert!(entry.eviction_pending());
    }
}
