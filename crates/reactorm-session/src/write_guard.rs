//! Write guard: who may mutate entities, and when.
//!
//! Outside a commit, application code may mutate freely (unless the session
//! is read-only). While a commit runs, only hook scopes carrying the token of
//! that commit may mutate, and only during the stage whose hooks are allowed
//! to write. The reaction engine writes derived values with its own actor
//! and is never blocked.

use crate::SessionMode;
use reactorm_core::{Error, Result};

/// The party attempting a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Application code using the session directly.
    Session,
    /// A hook scope issued by the commit with this token.
    Hook(u64),
    /// The reaction engine and commit pipeline.
    Engine,
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CommitStage {
    Hooks,
    Validation,
    Reactions,
    Flush,
    Write,
    AfterCommit,
}

impl CommitStage {
    /// Whether a failure in this stage leaves the store untouched.
    pub fn before_write(self) -> bool {
        self < CommitStage::Write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Closed,
    Writable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Idle,
    Committing {
        token: u64,
        stage: CommitStage,
        window: Window,
    },
}

#[derive(Debug)]
pub(crate) struct WriteGuard {
    state: CommitState,
    last_token: u64,
}

impl Default for WriteGuard {
    fn default() -> Self {
        Self {
            state: CommitState::Idle,
            last_token: 0,
        }
    }
}

impl WriteGuard {
    /// Start a commit and issue its token.
    pub fn begin(&mut self) -> Result<u64> {
        if self.is_committing() {
            return Err(Error::CommitInProgress);
        }
        self.last_token += 1;
        self.state = CommitState::Committing {
            token: self.last_token,
            stage: CommitStage::Hooks,
            window: Window::Closed,
        };
        Ok(self.last_token)
    }

    /// End the commit issued `token`. Later uses of its scopes are stale.
    pub fn finish(&mut self, token: u64) {
        if self.token() == Some(token) {
            self.state = CommitState::Idle;
        }
    }

    pub fn is_committing(&self) -> bool {
        matches!(self.state, CommitState::Committing { .. })
    }

    pub fn token(&self) -> Option<u64> {
        match self.state {
            CommitState::Committing { token, .. } => Some(token),
            CommitState::Idle => None,
        }
    }

    pub fn stage(&self) -> Option<CommitStage> {
        match self.state {
            CommitState::Committing { stage, .. } => Some(stage),
            CommitState::Idle => None,
        }
    }

    pub fn enter(&mut self, next: CommitStage) {
        if let CommitState::Committing { stage, window, .. } = &mut self.state {
            *stage = next;
            *window = Window::Closed;
        }
    }

    /// Open or close the window in which hook scopes may mutate.
    pub fn set_writable(&mut self, writable: bool) {
        if let CommitState::Committing { window, .. } = &mut self.state {
            *window = if writable {
                Window::Writable
            } else {
                Window::Closed
            };
        }
    }

    pub fn check(&self, mode: SessionMode, actor: Actor, operation: &'static str) -> Result<()> {
        match actor {
            Actor::Engine => Ok(()),
            _ if mode == SessionMode::ReadOnly => Err(Error::ReadOnly { operation }),
            Actor::Session => {
                if self.is_committing() {
                    Err(Error::WriteGuard { operation })
                } else {
                    Ok(())
                }
            }
            Actor::Hook(issued) => match self.state {
                CommitState::Committing { token, window, .. } if token == issued => {
                    if window == Window::Writable {
                        Ok(())
                    } else {
                        Err(Error::WriteGuard { operation })
                    }
                }
                _ => Err(Error::StaleHookScope { operation }),
            },
        }
    }

    /// Check that a hook scope may still read.
    pub fn check_scope(&self, actor: Actor, operation: &'static str) -> Result<()> {
        match (actor, self.token()) {
            (Actor::Hook(issued), Some(token)) if issued == token => Ok(()),
            (Actor::Hook(_), _) => Err(Error::StaleHookScope { operation }),
            _ => Ok(()),
        }
    }
}
