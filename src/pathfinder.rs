//! Path finding from roots (or an arbitrary source) to a target object.
//!
//! The sequential engine is a single explicit-stack DFS shared across every
//! root it is given: a `seen` set that is never reset mid-search turns
//! "prevent cycles" and "don't redo already-explored work" into the same
//! mechanism, and `knownEndPoints` lets a later branch splice in a
//! previously discovered route to the target instead of re-walking it.
//! Parallel mode runs the same per-root exploration concurrently, with
//! `seen` and `knownEndPoints` promoted to thread-safe shared state.

use crate::config::{HeapConfig, PathFinderConfig};
use crate::error::{HeapError, Result};
use crate::external::HeapHelpers;
use crate::memory_reader::MemoryReader;
use crate::object::{object_size, Object};
use crate::references::ReferenceEnumerator;
use crate::root::Root;
use crate::segment::SegmentIndex;
use crate::types::WellKnownTypes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A chain of references from a source/root to the target, inclusive of
/// both endpoints.
pub type Path = Vec<Object>;

/// Cooperative cancellation flag. Checked at loop boundaries and before
/// each child expansion; once signalled, at most one further path is
/// yielded before [`HeapError::Cancelled`] surfaces.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

type ProgressFn = Box<dyn FnMut(u64) + Send>;

/// Registry of progress callbacks, invoked every time the processed-object
/// count changes. Invocation happens on whichever thread advanced the
/// count (the enumerating thread, or — in parallel mode — the worker that
/// made progress).
pub struct ProgressCallbacks {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, ProgressFn)>>,
}

impl ProgressCallbacks {
    pub fn new() -> Self {
        ProgressCallbacks {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, callback: impl FnMut(u64) + Send + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push((id, Box::new(callback)));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }

    fn notify(&self, count: u64) {
        for (_, cb) in self.callbacks.lock().iter_mut() {
            cb(count);
        }
    }
}

impl Default for ProgressCallbacks {
    fn default() -> Self {
        ProgressCallbacks::new()
    }
}

/// Shared cycle/work-dedup set. A single address is visited at most once
/// across the whole search this set belongs to.
trait SeenSet {
    /// Returns `true` the first time `addr` is seen, `false` on every
    /// subsequent call.
    fn try_visit(&self, addr: u64) -> bool;
}

impl SeenSet for std::cell::RefCell<HashSet<u64>> {
    fn try_visit(&self, addr: u64) -> bool {
        self.borrow_mut().insert(addr)
    }
}

/// Lock-striped shared seen-set for parallel search: each address hashes to
/// one of a fixed number of stripes, so concurrent inserts to different
/// stripes never contend.
struct StripedSeenSet {
    stripes: Vec<Mutex<HashSet<u64>>>,
}

impl StripedSeenSet {
    fn new(stripes: usize) -> Self {
        StripedSeenSet {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }
}

impl SeenSet for StripedSeenSet {
    fn try_visit(&self, addr: u64) -> bool {
        let idx = (addr as usize) % self.stripes.len();
        self.stripes[idx].lock().insert(addr)
    }
}

/// The splice table: address → suffix path from that address to the
/// target, inclusive. Only consulted/populated when `unique == false`.
trait EndPoints {
    fn lookup(&self, addr: u64) -> Option<Arc<Path>>;
    fn register(&self, path: &Path);
}

impl EndPoints for std::cell::RefCell<HashMap<u64, Arc<Path>>> {
    fn lookup(&self, addr: u64) -> Option<Arc<Path>> {
        self.borrow().get(&addr).cloned()
    }
    fn register(&self, path: &Path) {
        let mut map = self.borrow_mut();
        for (i, obj) in path.iter().enumerate() {
            map.entry(obj.address).or_insert_with(|| Arc::new(path[i..].to_vec()));
        }
    }
}

/// The shared splice table, guarded by a single lock — contention here is
/// low relative to the graph traversal work happening around it.
struct SharedEndPoints(Mutex<HashMap<u64, Arc<Path>>>);

impl EndPoints for SharedEndPoints {
    fn lookup(&self, addr: u64) -> Option<Arc<Path>> {
        self.0.lock().get(&addr).cloned()
    }
    fn register(&self, path: &Path) {
        let mut map = self.0.lock();
        for (i, obj) in path.iter().enumerate() {
            map.entry(obj.address).or_insert_with(|| Arc::new(path[i..].to_vec()));
        }
    }
}

struct Frame {
    object: Object,
    pending: VecDeque<Object>,
}

enum Classification {
    Target,
    Ending(Path),
    Pending(Vec<Object>),
}

/// Finds chains of references from roots (or an arbitrary source address)
/// to a target object.
pub struct PathFinder<'h, H: HeapHelpers> {
    helpers: &'h H,
    well_known: &'h WellKnownTypes,
    config: HeapConfig,
    segment_index: &'h SegmentIndex,
    path_config: PathFinderConfig,
    progress: ProgressCallbacks,
}

impl<'h, H: HeapHelpers> PathFinder<'h, H> {
    pub fn new(
        helpers: &'h H,
        well_known: &'h WellKnownTypes,
        config: HeapConfig,
        segment_index: &'h SegmentIndex,
        path_config: PathFinderConfig,
    ) -> Self {
        PathFinder {
            helpers,
            well_known,
            config,
            segment_index,
            path_config,
            progress: ProgressCallbacks::new(),
        }
    }

    pub fn progress(&self) -> &ProgressCallbacks {
        &self.progress
    }

    fn resolve_object(&self, address: u64, reader: &mut MemoryReader<'h, H::Reader>) -> Object {
        let ty = reader
            .read_ptr(address)
            .and_then(|mt| self.helpers.get_or_create_type(mt, Some(address)))
            .unwrap_or_else(|| self.well_known.object_type.clone());
        Object::new(address, ty)
    }

    fn size_of(&self, object: &Object, reader: &mut MemoryReader<'h, H::Reader>) -> u64 {
        let is_large = self
            .segment_index
            .segment_of(object.address)
            .map(|s| s.is_large_object_segment)
            .unwrap_or(false);
        object_size(object, is_large, self.config.pointer_width, self.well_known, |addr| {
            reader.read_dword(addr)
        })
    }

    /// Finds the first path from `source` to `target`, or `None` if it is
    /// unreachable.
    pub fn find_single_path(
        &self,
        source: u64,
        target: u64,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Option<Path>> {
        let mut reader = MemoryReader::new(self.helpers.data_reader(), self.config.reader);
        let start = self.resolve_object(source, &mut reader);
        let seen = std::cell::RefCell::new(HashSet::new());
        let known_end_points = std::cell::RefCell::new(HashMap::new());
        let counter = AtomicU64::new(0);
        let references = ReferenceEnumerator::new(self.helpers, self.well_known, self.config, self.segment_index);

        let mut result = None;
        self.run_search(
            &references,
            &mut reader,
            &seen,
            &known_end_points,
            &counter,
            std::iter::once((None, start)),
            target,
            true, // unique: we only want the first path, no splicing needed.
            carefully,
            cancel,
            &mut |_root, path| {
                result = Some(path);
                false
            },
        )?;
        Ok(result)
    }

    /// All paths from `source` to `target`.
    pub fn enumerate_all_paths(
        &self,
        source: u64,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Path>> {
        let mut reader = MemoryReader::new(self.helpers.data_reader(), self.config.reader);
        let start = self.resolve_object(source, &mut reader);
        let seen = std::cell::RefCell::new(HashSet::new());
        let known_end_points = std::cell::RefCell::new(HashMap::new());
        let counter = AtomicU64::new(0);
        let references = ReferenceEnumerator::new(self.helpers, self.well_known, self.config, self.segment_index);

        let mut results = Vec::new();
        self.run_search(
            &references,
            &mut reader,
            &seen,
            &known_end_points,
            &counter,
            std::iter::once((None, start)),
            target,
            unique,
            carefully,
            cancel,
            &mut |_root, path| {
                results.push(path);
                true
            },
        )?;
        Ok(results)
    }

    /// Sequential multi-root search: every root is fed into the same DFS
    /// with shared `seen`/`knownEndPoints`, in enumeration order.
    pub fn enumerate_gc_roots(
        &self,
        roots: Vec<Root>,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<(Root, Path)>> {
        let mut reader = MemoryReader::new(self.helpers.data_reader(), self.config.reader);
        let seen = std::cell::RefCell::new(HashSet::new());
        let known_end_points = std::cell::RefCell::new(HashMap::new());
        let counter = AtomicU64::new(0);
        let references = ReferenceEnumerator::new(self.helpers, self.well_known, self.config, self.segment_index);

        let sources = roots
            .into_iter()
            .map(|r| {
                let obj = r.object().clone();
                (Some(r), obj)
            })
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        self.run_search(
            &references,
            &mut reader,
            &seen,
            &known_end_points,
            &counter,
            sources.into_iter(),
            target,
            unique,
            carefully,
            cancel,
            &mut |root, path| {
                if let Some(root) = root {
                    results.push((root, path));
                }
                true
            },
        )?;
        Ok(results)
    }

    /// Parallel multi-root search: fans out one task per root, bounded to
    /// `path_config.max_tasks()` concurrently in flight, only when
    /// `path_config.allow_parallel_search()` is set. Falls back to the
    /// sequential engine when parallel search isn't enabled, since the
    /// caller may not have a process-local memory cache to make concurrent
    /// reads safe.
    pub fn enumerate_gc_roots_parallel(
        &self,
        roots: Vec<Root>,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<(Root, Path)>>
    where
        H: Sync,
        H::Reader: Sync,
    {
        if !self.path_config.allow_parallel_search() {
            return self.enumerate_gc_roots(roots, target, unique, carefully, cancel);
        }
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let max_tasks = self.path_config.max_tasks().max(1);
        let seen = Arc::new(StripedSeenSet::new(max_tasks.max(16)));
        let known_end_points = Arc::new(SharedEndPoints(Mutex::new(HashMap::new())));
        let counter = Arc::new(AtomicU64::new(0));
        let (tx, rx) = crossbeam_channel::unbounded::<Result<(Root, Path)>>();
        let permits = crossbeam_channel::bounded::<()>(max_tasks);

        std::thread::scope(|scope| {
            for root in roots {
                if cancel.is_cancelled() {
                    break;
                }
                if permits.0.send(()).is_err() {
                    break;
                }
                let tx = tx.clone();
                let seen = Arc::clone(&seen);
                let known_end_points = Arc::clone(&known_end_points);
                let counter = Arc::clone(&counter);
                let cancel = cancel.clone();
                let release = permits.1.clone();
                scope.spawn(move || {
                    let mut reader = MemoryReader::new(self.helpers.data_reader(), self.config.reader);
                    let references =
                        ReferenceEnumerator::new(self.helpers, self.well_known, self.config, self.segment_index);
                    let start = root.object().clone();
                    let outcome = self.run_search(
                        &references,
                        &mut reader,
                        seen.as_ref(),
                        known_end_points.as_ref(),
                        counter.as_ref(),
                        std::iter::once((Some(root), start)),
                        target,
                        unique,
                        carefully,
                        &cancel,
                        &mut |root, path| {
                            if let Some(root) = root {
                                let _ = tx.send(Ok((root, path)));
                            }
                            true
                        },
                    );
                    if let Err(e) = outcome {
                        let _ = tx.send(Err(e));
                    }
                    let _ = release.recv();
                });
            }
            drop(tx);
        });

        rx.into_iter().collect()
    }

    /// The shared DFS core. `sources` seeds the search queue (one entry for
    /// a plain source/target search, one per root for `enumerateGCRoots`).
    /// `emit` is called once per discovered path; returning `false` stops
    /// the whole search early (used by `find_single_path`).
    #[allow(clippy::too_many_arguments)]
    fn run_search<S: SeenSet, E: EndPoints>(
        &self,
        references: &ReferenceEnumerator<'h, H>,
        reader: &mut MemoryReader<'h, H::Reader>,
        seen: &S,
        known_end_points: &E,
        processed_count: &AtomicU64,
        mut sources: impl Iterator<Item = (Option<Root>, Object)>,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
        emit: &mut dyn FnMut(Option<Root>, Path) -> bool,
    ) -> Result<()> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut current_root: Option<Root> = None;
        let mut cancelled = false;

        macro_rules! classify {
            ($object:expr) => {{
                let size = self.size_of(&$object, reader);
                let children = references.enumerate_references(&$object, size, carefully, true, reader);
                let mut target_found = false;
                let mut ending: Option<Path> = None;
                let mut pending = Vec::new();
                for child in children {
                    if child.address == target {
                        target_found = true;
                        continue;
                    }
                    if !unique {
                        if let Some(suffix) = known_end_points.lookup(child.address) {
                            if ending.is_none() {
                                ending = Some(suffix.as_ref().clone());
                            }
                            continue;
                        }
                    }
                    pending.push(child);
                }
                if target_found {
                    Classification::Target
                } else if let Some(suffix) = ending {
                    Classification::Ending(suffix)
                } else {
                    Classification::Pending(pending)
                }
            }};
        }

        'outer: loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if stack.is_empty() {
                let Some((root, start)) = sources.next() else {
                    break;
                };
                current_root = root;
                if !seen.try_visit(start.address) {
                    continue;
                }
                self.progress.notify(processed_count.fetch_add(1, Ordering::Relaxed) + 1);

                if start.address == target {
                    let path = vec![start];
                    if !unique {
                        known_end_points.register(&path);
                    }
                    if !emit(current_root.clone(), path) {
                        break;
                    }
                    continue;
                }

                match classify!(start) {
                    Classification::Target => {
                        let target_obj = self.resolve_object(target, reader);
                        let path = vec![start, target_obj];
                        if !unique {
                            known_end_points.register(&path);
                        }
                        if !emit(current_root.clone(), path) {
                            break;
                        }
                    }
                    Classification::Ending(suffix) => {
                        let mut path = vec![start];
                        path.extend(suffix);
                        if !unique {
                            known_end_points.register(&path);
                        }
                        if !emit(current_root.clone(), path) {
                            break;
                        }
                    }
                    Classification::Pending(children) => {
                        stack.push(Frame {
                            object: start,
                            pending: VecDeque::from(children),
                        });
                    }
                }
                continue;
            }

            loop {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'outer;
                }
                let top = stack.last_mut().unwrap();
                let Some(child) = top.pending.pop_front() else {
                    stack.pop();
                    break;
                };
                if !seen.try_visit(child.address) {
                    continue;
                }
                self.progress.notify(processed_count.fetch_add(1, Ordering::Relaxed) + 1);

                match classify!(child) {
                    Classification::Target => {
                        let target_obj = self.resolve_object(target, reader);
                        let mut path: Vec<Object> = stack.iter().map(|f| f.object.clone()).collect();
                        path.push(child);
                        path.push(target_obj);
                        if !unique {
                            known_end_points.register(&path);
                        }
                        if !emit(current_root.clone(), path) {
                            break 'outer;
                        }
                    }
                    Classification::Ending(suffix) => {
                        let mut path: Vec<Object> = stack.iter().map(|f| f.object.clone()).collect();
                        path.push(child);
                        path.extend(suffix);
                        if !unique {
                            known_end_points.register(&path);
                        }
                        if !emit(current_root.clone(), path) {
                            break 'outer;
                        }
                    }
                    Classification::Pending(children) => {
                        stack.push(Frame {
                            object: child,
                            pending: VecDeque::from(children),
                        });
                        break;
                    }
                }
            }
        }

        if cancelled {
            log::debug!("path search cancelled with {} frame(s) still on the stack", stack.len());
            return Err(HeapError::Cancelled);
        }
        Ok(())
    }
}
