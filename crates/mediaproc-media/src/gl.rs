//! The GL thread: owns GPU contexts and every texture-backed sample.
//!
//! Other threads hand work to it with [`GlHandle::call`] (blocking, returns
//! the task's result) or [`GlHandle::post`] (fire and forget).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use mediaproc_transport::{Mailbox, TextureId};
use tracing::{debug, info, warn};

pub type GlSessionId = u64;

type GlTask = Box<dyn FnOnce(&mut GlState) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum GlError {
    #[error("gl thread is gone")]
    ThreadGone,
    #[error("gl context unavailable")]
    ContextUnavailable,
    #[error("gl call from the gl thread would deadlock")]
    Reentrant,
    #[error("failed to spawn gl thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A decoded video frame living in a GL texture.
///
/// Shared between the pipeline and the GL thread's bound-sample table; the
/// texture stays valid while any clone is alive.
#[derive(Debug, Clone)]
pub struct Sample(Arc<SampleData>);

#[derive(Debug)]
struct SampleData {
    texture_id: TextureId,
    width: u32,
    height: u32,
}

impl Sample {
    pub fn new(texture_id: TextureId, width: u32, height: u32) -> Self {
        Self(Arc::new(SampleData {
            texture_id,
            width,
            height,
        }))
    }

    pub fn texture_id(&self) -> TextureId {
        self.0.texture_id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Opaque GPU capability acquired by the media process.
pub trait GlContextProvider: Send {
    /// Make a context current on the calling (GL) thread.
    fn bind_to_current_thread(&mut self) -> bool;
    /// Publish a texture to the compositor and return its mailbox.
    fn produce_texture(&mut self, texture_id: TextureId) -> Mailbox;
}

/// Context provider for headless operation: always binds and mints random
/// mailboxes.
#[derive(Default)]
pub struct OffscreenContextProvider;

impl GlContextProvider for OffscreenContextProvider {
    fn bind_to_current_thread(&mut self) -> bool {
        true
    }

    fn produce_texture(&mut self, _texture_id: TextureId) -> Mailbox {
        Mailbox::generate()
    }
}

/// Result of offering a new frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The sample is now bound and published under `mailbox`.
    Bound { mailbox: Mailbox },
    /// Same texture re-delivered right after preroll; dropped.
    PrerollDuplicate,
    /// The renderer has not released the previous sample for this texture.
    StillBound,
    InvalidTexture,
    NoContext,
}

#[derive(Default)]
struct GlSession {
    samples: HashMap<TextureId, Sample>,
}

/// State only ever touched on the GL thread.
pub struct GlState {
    provider: Box<dyn GlContextProvider>,
    sessions: HashMap<GlSessionId, GlSession>,
    next_session: GlSessionId,
}

impl GlState {
    fn new(provider: Box<dyn GlContextProvider>) -> Self {
        Self {
            provider,
            sessions: HashMap::new(),
            next_session: 1,
        }
    }

    /// Bind a context for a new player session.
    pub fn setup_context(&mut self) -> Result<GlSessionId, GlError> {
        if !self.provider.bind_to_current_thread() {
            warn!("gl: could not bind context");
            return Err(GlError::ContextUnavailable);
        }
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id, GlSession::default());
        debug!(session = id, "gl: context ready");
        Ok(id)
    }

    pub fn bind_frame(
        &mut self,
        session: GlSessionId,
        sample: Sample,
        was_preroll: bool,
    ) -> FrameOutcome {
        let texture_id = sample.texture_id();
        if texture_id == 0 {
            return FrameOutcome::InvalidTexture;
        }
        let Some(state) = self.sessions.get_mut(&session) else {
            return FrameOutcome::NoContext;
        };
        if state.samples.contains_key(&texture_id) {
            return if was_preroll {
                FrameOutcome::PrerollDuplicate
            } else {
                FrameOutcome::StillBound
            };
        }
        state.samples.insert(texture_id, sample);
        let mailbox = self.provider.produce_texture(texture_id);
        FrameOutcome::Bound { mailbox }
    }

    /// Drop the bound sample for `texture_id`. Returns whether one was bound.
    pub fn release_texture(&mut self, session: GlSessionId, texture_id: TextureId) -> bool {
        self.sessions
            .get_mut(&session)
            .and_then(|s| s.samples.remove(&texture_id))
            .is_some()
    }

    /// Drop every bound sample of a session. Returns how many were dropped.
    pub fn cleanup_samples(&mut self, session: GlSessionId) -> usize {
        self.sessions
            .get_mut(&session)
            .map(|s| {
                let n = s.samples.len();
                s.samples.clear();
                n
            })
            .unwrap_or(0)
    }

    pub fn cleanup_context(&mut self, session: GlSessionId) {
        if self.sessions.remove(&session).is_some() {
            debug!(session, "gl: context released");
        }
    }

    pub fn bound_textures(&self, session: GlSessionId) -> Vec<TextureId> {
        let mut ids: Vec<_> = self
            .sessions
            .get(&session)
            .map(|s| s.samples.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

/// Cloneable submission handle for the GL thread.
#[derive(Clone)]
pub struct GlHandle {
    tx: mpsc::Sender<GlTask>,
    thread_id: ThreadId,
}

impl GlHandle {
    /// Run `task` on the GL thread and wait for its result.
    pub fn call<R, F>(&self, task: F) -> Result<R, GlError>
    where
        R: Send + 'static,
        F: FnOnce(&mut GlState) -> R + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Err(GlError::Reentrant);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Box::new(move |state| {
                let _ = reply_tx.send(task(state));
            }))
            .map_err(|_| GlError::ThreadGone)?;
        reply_rx.recv().map_err(|_| GlError::ThreadGone)
    }

    /// Queue `task` on the GL thread without waiting.
    pub fn post<F>(&self, task: F) -> Result<(), GlError>
    where
        F: FnOnce(&mut GlState) + Send + 'static,
    {
        self.tx.send(Box::new(task)).map_err(|_| GlError::ThreadGone)
    }
}

/// Owns the GL thread. Dropping it stops the thread once every
/// [`GlHandle`] is gone and queued tasks have run.
pub struct GlThread {
    handle: GlHandle,
    join: Option<JoinHandle<()>>,
}

impl GlThread {
    pub fn spawn(provider: Box<dyn GlContextProvider>) -> Result<Self, GlError> {
        let (tx, rx) = mpsc::channel::<GlTask>();
        let join = thread::Builder::new()
            .name("media-gl".into())
            .spawn(move || {
                let mut state = GlState::new(provider);
                while let Ok(task) = rx.recv() {
                    task(&mut state);
                }
                info!("gl: thread exiting");
            })?;
        let thread_id = join.thread().id();
        Ok(Self {
            handle: GlHandle { tx, thread_id },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> GlHandle {
        self.handle.clone()
    }
}

impl Drop for GlThread {
    fn drop(&mut self) {
        // Replace our sender so the receive loop can end.
        let (dead_tx, _) = mpsc::channel();
        self.handle.tx = dead_tx;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
