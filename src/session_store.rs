//! Window session state: creation, navigation, and page bookkeeping.
//!
//! Every mutation funnels through one `with_session` critical section, so
//! the three page sets move together and the scheduler always reads a
//! consistent snapshot before its next pickup.

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::store::MemoryStore;
use crate::types::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Navigation actions a client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    Extend,
    Jump,
    Cancel,
}

impl NavAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extend" => Some(NavAction::Extend),
            "jump" => Some(NavAction::Jump),
            "cancel" => Some(NavAction::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NavAction::Extend => "extend",
            NavAction::Jump => "jump",
            NavAction::Cancel => "cancel",
        }
    }
}

/// Result of a navigation update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub session: WindowSession,
    /// Action after extend -> jump promotion.
    pub action: NavAction,
    /// Pages that were pending or in progress and fell out of the window.
    pub canceled_pages: Vec<u32>,
    /// Pages newly added to the window.
    pub new_pages: Vec<u32>,
}

pub struct SessionStore {
    store: Arc<MemoryStore>,
    window_max_pages: u32,
    text_lookahead: u32,
    ppt_lookahead: u32,
    jump_threshold: u32,
    max_lifetime_ms: i64,
}

impl SessionStore {
    pub fn new(store: Arc<MemoryStore>, config: &AppConfig) -> Self {
        Self {
            store,
            window_max_pages: config.window_max_pages,
            text_lookahead: config.text_lookahead,
            ppt_lookahead: config.ppt_lookahead,
            jump_threshold: config.jump_threshold,
            max_lifetime_ms: config.session_max_lifetime.as_millis() as i64,
        }
    }

    fn lookahead(&self, kind: PdfKind) -> u32 {
        match kind {
            PdfKind::Text => self.text_lookahead.min(self.window_max_pages - 1),
            PdfKind::Ppt => self.ppt_lookahead.min(self.window_max_pages - 1),
        }
    }

    /// Start a session with the window seeded around the current page.
    pub fn start(
        &self,
        user_id: &str,
        file: &FileRecord,
        current_page: u32,
        pdf_kind: PdfKind,
        locale: Locale,
    ) -> Result<WindowSession, ApiError> {
        let window_end = (current_page + self.lookahead(pdf_kind)).min(file.page_count);
        let now = now_ms();
        let session = WindowSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            file_id: file.id.clone(),
            pdf_kind,
            locale,
            state: SessionState::Active,
            window_start: current_page,
            window_end,
            current_page,
            total_pages: file.page_count,
            pages_completed: BTreeSet::new(),
            pages_in_progress: BTreeSet::new(),
            pages_failed: BTreeSet::new(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        match self.store.create_session(session) {
            Ok(session) => {
                info!(
                    "session {} started: window {}..{} ({:?})",
                    session.id, session.window_start, session.window_end, pdf_kind
                );
                Ok(session)
            }
            Err(existing_id) => Err(ApiError::SessionExists { session_id: existing_id }),
        }
    }

    /// Read a session, expiring it lazily when it outlived the bound.
    pub fn get(&self, session_id: &str) -> Option<WindowSession> {
        let session = self.store.session(session_id)?;
        if session.state == SessionState::Active
            && now_ms() - session.created_at_ms > self.max_lifetime_ms
        {
            debug!("session {} expired", session_id);
            return self
                .store
                .with_session(session_id, |s| {
                    s.state = SessionState::Expired;
                    s.clone()
                });
        }
        Some(session)
    }

    pub fn is_jump(&self, from: u32, to: u32) -> bool {
        from.abs_diff(to) > self.jump_threshold
    }

    /// Apply a navigation update. `extend` is promoted to `jump` when the
    /// page delta exceeds the threshold.
    pub fn update(
        &self,
        session_id: &str,
        current_page: u32,
        action: NavAction,
    ) -> Result<UpdateOutcome, ApiError> {
        let session = self.get(session_id).ok_or(ApiError::NotFound)?;
        if session.state != SessionState::Active {
            return Err(ApiError::SessionNotActive);
        }

        let action = match action {
            NavAction::Extend if self.is_jump(session.current_page, current_page) => NavAction::Jump,
            other => other,
        };

        let lookahead = self.lookahead(session.pdf_kind);
        let window_max = self.window_max_pages;
        let outcome = self
            .store
            .with_session(session_id, |s| match action {
                NavAction::Cancel => {
                    let canceled: Vec<u32> = pending_pages(s)
                        .into_iter()
                        .chain(s.pages_in_progress.iter().copied())
                        .collect();
                    s.state = SessionState::Canceled;
                    UpdateOutcome {
                        session: s.clone(),
                        action,
                        canceled_pages: canceled,
                        new_pages: vec![],
                    }
                }
                NavAction::Extend => {
                    let old_start = s.window_start;
                    let old_end = s.window_end;
                    let new_end = (current_page + lookahead).min(s.total_pages);
                    // Shift forward, never past the current page, keeping
                    // the window within its size bound.
                    let floor = (new_end + 1).saturating_sub(window_max).max(1);
                    let new_start = old_start.min(current_page).max(floor);

                    s.current_page = current_page;
                    s.window_start = new_start;
                    s.window_end = new_end;

                    let canceled: Vec<u32> = (old_start..=old_end)
                        .filter(|p| *p < new_start || *p > new_end)
                        .filter(|p| {
                            !s.pages_completed.contains(p)
                                && !s.pages_in_progress.contains(p)
                                && !s.pages_failed.contains(p)
                        })
                        .collect();
                    let new_pages: Vec<u32> = (new_start..=new_end)
                        .filter(|p| *p < old_start || *p > old_end)
                        .collect();
                    UpdateOutcome {
                        session: s.clone(),
                        action,
                        canceled_pages: canceled,
                        new_pages,
                    }
                }
                NavAction::Jump => {
                    let old_start = s.window_start;
                    let old_end = s.window_end;
                    let new_end = (current_page + lookahead).min(s.total_pages);
                    let new_start = current_page;

                    // Pending and in-progress work outside the new window is
                    // dropped from the books; running generations finish and
                    // cache their stickers, they just stop counting here.
                    let mut canceled: Vec<u32> = (old_start..=old_end)
                        .filter(|p| *p < new_start || *p > new_end)
                        .filter(|p| {
                            !s.pages_completed.contains(p) && !s.pages_failed.contains(p)
                        })
                        .collect();
                    canceled.sort_unstable();
                    s.pages_in_progress
                        .retain(|p| *p >= new_start && *p <= new_end);

                    s.current_page = current_page;
                    s.window_start = new_start;
                    s.window_end = new_end;

                    let new_pages: Vec<u32> = (new_start..=new_end)
                        .filter(|p| *p < old_start || *p > old_end)
                        .collect();
                    UpdateOutcome {
                        session: s.clone(),
                        action,
                        canceled_pages: canceled,
                        new_pages,
                    }
                }
            })
            .ok_or_else(|| ApiError::UpdateFailed("session disappeared mid-update".to_string()))?;

        debug!(
            "session {} {}: window {}..{}, {} canceled, {} new",
            session_id,
            action.as_str(),
            outcome.session.window_start,
            outcome.session.window_end,
            outcome.canceled_pages.len(),
            outcome.new_pages.len()
        );
        Ok(outcome)
    }

    /// Force-cancel (DELETE endpoint and shutdown paths).
    pub fn cancel(&self, session_id: &str) -> Result<WindowSession, ApiError> {
        self.store
            .with_session(session_id, |s| {
                if s.state == SessionState::Active {
                    s.state = SessionState::Canceled;
                }
                s.clone()
            })
            .ok_or(ApiError::NotFound)
    }

    // ── Scheduler-facing page bookkeeping ────────────────────────────────

    /// Atomically move pages from pending to in-progress. Returns the pages
    /// actually claimed; pages that raced out of the window or got covered
    /// in the meantime are dropped.
    pub fn claim_pages(&self, session_id: &str, pages: &[u32]) -> Vec<u32> {
        self.store
            .with_session(session_id, |s| {
                if s.state != SessionState::Active {
                    return vec![];
                }
                let covered = s.covered_pages();
                let claimed: Vec<u32> = pages
                    .iter()
                    .copied()
                    .filter(|p| *p >= s.window_start && *p <= s.window_end)
                    .filter(|p| !covered.contains(p))
                    .collect();
                for page in &claimed {
                    s.pages_in_progress.insert(*page);
                }
                claimed
            })
            .unwrap_or_default()
    }

    /// Record a finished page. Pages that left the window since their claim
    /// are not counted. Completes the session when the window is covered.
    pub fn mark_page_done(&self, session_id: &str, page: u32, failed: bool) -> Option<WindowSession> {
        self.store.with_session(session_id, |s| {
            s.pages_in_progress.remove(&page);
            if page >= s.window_start && page <= s.window_end {
                if failed {
                    s.pages_failed.insert(page);
                } else {
                    s.pages_completed.insert(page);
                }
            }
            if s.state == SessionState::Active && s.pages_in_progress.is_empty() {
                let all_covered = (s.window_start..=s.window_end)
                    .all(|p| s.pages_completed.contains(&p) || s.pages_failed.contains(&p));
                if all_covered {
                    s.state = SessionState::Completed;
                }
            }
            s.clone()
        })
    }
}

/// Window pages not yet claimed, completed, or failed.
fn pending_pages(session: &WindowSession) -> Vec<u32> {
    let covered = session.covered_pages();
    (session.window_start..=session.window_end)
        .filter(|p| !covered.contains(p))
        .collect()
}

/// Priority order for prefetching: the page being read first, then forward
/// pages at twice the rate of backward ones.
pub fn pages_to_generate(
    window_start: u32,
    window_end: u32,
    covered: &BTreeSet<u32>,
    current: u32,
) -> Vec<u32> {
    if window_start > window_end {
        return vec![];
    }
    let mut ordered = Vec::new();
    let mut push = |page: i64, ordered: &mut Vec<u32>| {
        if page >= window_start as i64 && page <= window_end as i64 {
            let page = page as u32;
            if !covered.contains(&page) && !ordered.contains(&page) {
                ordered.push(page);
            }
        }
    };

    push(current as i64, &mut ordered);
    let mut forward = current as i64 + 1;
    let mut backward = current as i64 - 1;
    // Rhythm after the current page: +1, -1, then two forward for every
    // backward step.
    push(forward, &mut ordered);
    forward += 1;
    push(backward, &mut ordered);
    backward -= 1;
    while forward <= window_end as i64 || backward >= window_start as i64 {
        push(forward, &mut ordered);
        forward += 1;
        push(forward, &mut ordered);
        forward += 1;
        push(backward, &mut ordered);
        backward -= 1;
    }
    ordered
}
