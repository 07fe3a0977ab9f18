use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

/// The signed-in user on whose behalf uploads are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub access_token: Option<String>,
}

/// Shared, swappable view of the current [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionHandle {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().and_then(|session| session.access_token)
    }

    pub fn sign_in(&self, session: Session) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn sign_out(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
