//! Test Support
//!
//! An in-memory [`GraphicsBackend`] with scriptable behavior, plus a
//! mutable [`DisplayProvider`]. This is the crate's single fault-injection
//! seam: instead of scattering debug-only branches through the core logic,
//! tests (and soak harnesses) inject failures here.
//!
//! # Capabilities
//!
//! - **Memory budget**: allocations beyond the budget fail with
//!   `OutOfVideoMemory`; destruction returns budget, so eviction-retry
//!   loops can be exercised deterministically.
//! - **Query scripting**: issued completion queries are numbered in issue
//!   order; [`MockControl::complete_issued`] moves the simulated GPU
//!   forward. Query support can be switched off to exercise the probe path.
//! - **Fault injection**: a hook or a one-shot plan fails chosen operations
//!   with chosen errors.
//! - **Counters**: created/destroyed resources, compiled states, flushing
//!   polls, presents.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::{
    AdapterId, BufferDesc, DeviceContext, DeviceCreateFlags, DrawCall, GraphicsBackend,
    PresentParams, QueryHandle, QueryStatus, RenderTargetDesc, ResourceHandle, StateHandle,
    TextureDesc,
};
use crate::device::state_cache::StateDescriptor;
use crate::display::{DisplayConfig, DisplayProvider};
use crate::errors::{GpuError, Result};

/// Operations the mock backend can be told to fail.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MockOp {
    CreateContext,
    CreateTexture,
    CreateBuffer,
    CreateRenderTarget,
    Upload,
    CompileState,
    CreateQuery,
    IssueQuery,
    PollQuery,
    SetRenderTarget,
    Draw,
    Present,
}

type FaultHook = Box<dyn Fn(MockOp) -> Option<GpuError> + Send + Sync>;

#[derive(Default)]
struct MockInner {
    // -- configuration --
    memory_budget: Option<u64>,
    queries_supported: bool,
    planned_faults: Vec<(MockOp, GpuError, usize)>,
    present_results: VecDeque<GpuError>,

    // -- resources --
    next_handle: u64,
    live: FxHashMap<ResourceHandle, u64>,
    used_bytes: u64,
    destroyed: Vec<ResourceHandle>,

    // -- queries --
    issue_counter: u64,
    completed_through: u64,
    query_issue_seq: FxHashMap<QueryHandle, u64>,
    created_queries: usize,
    destroyed_queries: usize,

    // -- counters --
    compiled_states: usize,
    flushing_polls: usize,
    presents: usize,
}

struct MockState {
    inner: Mutex<MockInner>,
    hook: Mutex<Option<FaultHook>>,
}

impl MockState {
    fn check_fault(&self, op: MockOp) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner
                .planned_faults
                .iter_mut()
                .find(|(o, _, remaining)| *o == op && *remaining > 0)
            {
                slot.2 -= 1;
                return Err(slot.1.clone());
            }
        }
        if let Some(hook) = self.hook.lock().as_ref() {
            if let Some(err) = hook(op) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn allocate(&self, op: MockOp, size: u64) -> Result<ResourceHandle> {
        self.check_fault(op)?;
        let mut inner = self.inner.lock();
        if let Some(budget) = inner.memory_budget {
            if inner.used_bytes + size > budget {
                return Err(GpuError::OutOfVideoMemory);
            }
        }
        inner.next_handle += 1;
        let handle = ResourceHandle(inner.next_handle);
        inner.live.insert(handle, size);
        inner.used_bytes += size;
        Ok(handle)
    }
}

// ─── Backend ─────────────────────────────────────────────────────────────────

/// Scriptable in-memory graphics backend.
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    /// Creates a backend plus the control handle tests steer it with.
    #[must_use]
    pub fn new() -> (Arc<Self>, MockControl) {
        let state = Arc::new(MockState {
            inner: Mutex::new(MockInner {
                queries_supported: true,
                ..MockInner::default()
            }),
            hook: Mutex::new(None),
        });
        (
            Arc::new(Self {
                state: Arc::clone(&state),
            }),
            MockControl { state },
        )
    }
}

impl GraphicsBackend for MockBackend {
    fn create_context(
        &self,
        _adapter: AdapterId,
        _flags: DeviceCreateFlags,
    ) -> Result<Box<dyn DeviceContext>> {
        self.state.check_fault(MockOp::CreateContext)?;
        Ok(Box::new(MockContext {
            state: Arc::clone(&self.state),
        }))
    }

    fn create_software_context(&self) -> Result<Box<dyn DeviceContext>> {
        Ok(Box::new(MockContext {
            state: Arc::clone(&self.state),
        }))
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// One mock command context. All contexts created by a backend share its
/// state, so a single control handle observes every device.
pub struct MockContext {
    state: Arc<MockState>,
}

impl DeviceContext for MockContext {
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<ResourceHandle> {
        self.state.allocate(MockOp::CreateTexture, desc.size_estimate())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceHandle> {
        self.state.allocate(MockOp::CreateBuffer, desc.size)
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<ResourceHandle> {
        self.state
            .allocate(MockOp::CreateRenderTarget, desc.size_estimate())
    }

    fn upload(&mut self, resource: ResourceHandle, _offset: u64, _bytes: &[u8]) -> Result<()> {
        self.state.check_fault(MockOp::Upload)?;
        if self.state.inner.lock().live.contains_key(&resource) {
            Ok(())
        } else {
            Err(GpuError::InvalidArgument("unknown resource"))
        }
    }

    fn destroy_resource(&mut self, resource: ResourceHandle) {
        let mut inner = self.state.inner.lock();
        if let Some(size) = inner.live.remove(&resource) {
            inner.used_bytes -= size;
        }
        inner.destroyed.push(resource);
    }

    fn compile_state(&mut self, _desc: &StateDescriptor) -> Result<StateHandle> {
        self.state.check_fault(MockOp::CompileState)?;
        let mut inner = self.state.inner.lock();
        inner.compiled_states += 1;
        inner.next_handle += 1;
        Ok(StateHandle(inner.next_handle))
    }

    fn create_completion_query(&mut self) -> Result<QueryHandle> {
        self.state.check_fault(MockOp::CreateQuery)?;
        let mut inner = self.state.inner.lock();
        if !inner.queries_supported {
            return Err(GpuError::NotSupported);
        }
        inner.created_queries += 1;
        inner.next_handle += 1;
        Ok(QueryHandle(inner.next_handle))
    }

    fn issue_query(&mut self, query: QueryHandle) -> Result<()> {
        self.state.check_fault(MockOp::IssueQuery)?;
        let mut inner = self.state.inner.lock();
        inner.issue_counter += 1;
        let seq = inner.issue_counter;
        inner.query_issue_seq.insert(query, seq);
        Ok(())
    }

    fn poll_query(&mut self, query: QueryHandle, flush: bool) -> Result<QueryStatus> {
        if flush {
            self.state.inner.lock().flushing_polls += 1;
        }
        self.state.check_fault(MockOp::PollQuery)?;
        let inner = self.state.inner.lock();
        let seq = inner
            .query_issue_seq
            .get(&query)
            .copied()
            .ok_or(GpuError::InvalidArgument("query was never issued"))?;
        if seq <= inner.completed_through {
            Ok(QueryStatus::Consumed)
        } else {
            Ok(QueryStatus::Pending)
        }
    }

    fn destroy_query(&mut self, query: QueryHandle) {
        let mut inner = self.state.inner.lock();
        inner.query_issue_seq.remove(&query);
        inner.destroyed_queries += 1;
    }

    fn set_render_target(&mut self, _target: ResourceHandle) -> Result<()> {
        self.state.check_fault(MockOp::SetRenderTarget)
    }

    fn draw(&mut self, _call: &DrawCall) -> Result<()> {
        self.state.check_fault(MockOp::Draw)
    }

    fn present(&mut self, _params: &PresentParams) -> Result<()> {
        {
            let mut inner = self.state.inner.lock();
            if let Some(err) = inner.present_results.pop_front() {
                return Err(err);
            }
        }
        self.state.check_fault(MockOp::Present)?;
        self.state.inner.lock().presents += 1;
        Ok(())
    }
}

// ─── Control ─────────────────────────────────────────────────────────────────

/// Handle tests use to steer and observe a [`MockBackend`].
pub struct MockControl {
    state: Arc<MockState>,
}

impl MockControl {
    // ── Configuration ──────────────────────────────────────────────────────

    /// Total bytes of simulated video memory; `None` means unlimited.
    pub fn set_memory_budget(&self, budget: Option<u64>) {
        self.state.inner.lock().memory_budget = budget;
    }

    /// Toggles completion-query support (exercises the probe path).
    pub fn set_queries_supported(&self, supported: bool) {
        self.state.inner.lock().queries_supported = supported;
    }

    /// Fails the next `times` occurrences of `op` with `err`.
    pub fn fail_times(&self, op: MockOp, err: GpuError, times: usize) {
        self.state.inner.lock().planned_faults.push((op, err, times));
    }

    /// Installs a fault-injection hook consulted on every operation after
    /// planned faults.
    pub fn set_fault_hook(
        &self,
        hook: impl Fn(MockOp) -> Option<GpuError> + Send + Sync + 'static,
    ) {
        *self.state.hook.lock() = Some(Box::new(hook));
    }

    /// Queues results for upcoming presents; drained before any fault plan.
    pub fn fail_next_present(&self, err: GpuError) {
        self.state.inner.lock().present_results.push_back(err);
    }

    // ── Simulated GPU progress ─────────────────────────────────────────────

    /// Marks the first `n` issued queries (in issue order) as consumed.
    pub fn complete_issued(&self, n: u64) {
        self.state.inner.lock().completed_through = n;
    }

    /// Number of queries issued so far.
    #[must_use]
    pub fn issued_queries(&self) -> u64 {
        self.state.inner.lock().issue_counter
    }

    // ── Observation ────────────────────────────────────────────────────────

    /// Handles destroyed so far, in destruction order.
    #[must_use]
    pub fn destroyed_resources(&self) -> Vec<ResourceHandle> {
        self.state.inner.lock().destroyed.clone()
    }

    /// Number of live (created, not destroyed) resources.
    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.state.inner.lock().live.len()
    }

    /// Simulated video memory currently in use.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.inner.lock().used_bytes
    }

    /// Number of state objects the backend actually compiled.
    #[must_use]
    pub fn compiled_states(&self) -> usize {
        self.state.inner.lock().compiled_states
    }

    /// Number of polls that requested a flush.
    #[must_use]
    pub fn flushing_polls(&self) -> usize {
        self.state.inner.lock().flushing_polls
    }

    /// Number of successful presents.
    #[must_use]
    pub fn presents(&self) -> usize {
        self.state.inner.lock().presents
    }

    /// Number of completion queries the backend has created.
    #[must_use]
    pub fn created_queries(&self) -> usize {
        self.state.inner.lock().created_queries
    }

    /// Number of destroyed completion queries.
    #[must_use]
    pub fn destroyed_queries(&self) -> usize {
        self.state.inner.lock().destroyed_queries
    }

    /// Creates a bare context sharing this control's state, for driving
    /// components directly without a device.
    #[must_use]
    pub fn raw_context(&self) -> Box<dyn DeviceContext> {
        Box::new(MockContext {
            state: Arc::clone(&self.state),
        })
    }
}

// ─── Displays ────────────────────────────────────────────────────────────────

/// Mutable display-configuration source for tests.
pub struct TestDisplays {
    current: Mutex<Arc<DisplayConfig>>,
}

impl TestDisplays {
    /// Starts at generation 1 with a single default adapter.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Arc::new(DisplayConfig::new(1, vec![AdapterId(0)]))),
        })
    }

    /// Replaces the topology with a new generation.
    pub fn set(&self, config: DisplayConfig) {
        *self.current.lock() = Arc::new(config);
    }

    /// Bumps the generation, keeping the adapter list.
    pub fn change(&self) {
        let mut current = self.current.lock();
        let next = DisplayConfig::new(current.generation() + 1, current.adapters().to_vec());
        *current = Arc::new(next);
    }
}

impl DisplayProvider for TestDisplays {
    fn current(&self) -> Arc<DisplayConfig> {
        Arc::clone(&self.current.lock())
    }
}
