//! Redirection control.
//!
//! Redirection routes every child of the root into off-screen pixmaps and
//! makes us responsible for the screen contents. Starting maps the overlay
//! and binds an image for every viewable window; stopping releases every
//! image and gives the screen back to the server. The delayed-unredirect
//! timer only fires when the per-frame verdict still holds at its deadline.

use anyhow::Result;
use tracing::{debug, info};
use x11rb::protocol::composite::{ConnectionExt as _, Redirect};
use x11rb::protocol::xproto::ConnectionExt as _;

use crate::core::Core;
use crate::session::{bind_window_image, Session};
use crate::win::WinFlags;

/// What the controller should do after a preprocess pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirAction {
    None,
    Start,
    Stop,
}

/// Grace-delay bookkeeping for unredirection.
#[derive(Debug, Default)]
pub struct UnredirTimer {
    deadline_ms: Option<u64>,
}

impl UnredirTimer {
    /// Feed the frame's verdict. `Stop` only comes back once the condition
    /// has held for the full configured delay (or immediately with no
    /// delay); losing the condition disarms the timer and re-redirects.
    pub fn decide(
        &mut self,
        possible: bool,
        redirected: bool,
        delay_ms: u64,
        now_ms: u64,
    ) -> RedirAction {
        if !possible {
            self.deadline_ms = None;
            return if redirected { RedirAction::None } else { RedirAction::Start };
        }
        if !redirected {
            return RedirAction::None;
        }
        if delay_ms == 0 {
            return RedirAction::Stop;
        }
        match self.deadline_ms {
            None => {
                self.deadline_ms = Some(now_ms + delay_ms);
                RedirAction::None
            }
            Some(d) if now_ms >= d => {
                self.deadline_ms = None;
                RedirAction::Stop
            }
            Some(_) => RedirAction::None,
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ms
    }
}

impl Session {
    /// Start compositing: overlay up, subwindows redirected, damage ring
    /// live, every viewable window rebound. Per-window bind failures are
    /// quarantined, they never fail the start.
    pub(crate) fn redir_start(&mut self) -> Result<()> {
        if self.core.redirected {
            return Ok(());
        }
        debug!("Redirecting screen");

        if let Some(overlay) = self.overlay {
            self.conn.map_window(overlay)?;
        }
        self.conn
            .composite_redirect_subwindows(self.root, Redirect::MANUAL)?;
        // Settle the redirect before naming any pixmap.
        self.conn.get_input_focus()?.reply()?;

        self.core.redirected = true;
        self.core.damage.reset(self.backend.max_buffer_age());

        for key in self.core.stack.order_snapshot() {
            let viewable = self
                .core
                .stack
                .get(key)
                .map(|w| w.viewable() && !w.input_only)
                .unwrap_or(false);
            if !viewable {
                continue;
            }
            let Session { core, backend, conn, visuals, errors, .. } = self;
            let w = core.stack.get_mut(key).unwrap();
            if bind_window_image(conn, visuals, errors, backend.as_mut(), w) {
                w.flags.remove(WinFlags::STALE_IMAGE | WinFlags::IMAGE_ERROR);
            } else {
                w.flags.insert(WinFlags::IMAGE_ERROR);
            }
        }

        self.core.force_repaint();
        self.needs_render = true;
        info!("Screen redirected");
        Ok(())
    }

    /// Stop compositing and hand the screen back.
    pub(crate) fn redir_stop(&mut self) -> Result<()> {
        if !self.core.redirected {
            return Ok(());
        }
        debug!("Unredirecting screen");

        // Images expire with the redirection; drop them all.
        for key in self.core.stack.order_snapshot() {
            let Session { core, backend, .. } = self;
            if let Some(w) = core.stack.get_mut(key) {
                Core::release_win_images(w, backend.as_mut());
                w.flags.remove(WinFlags::STALE_IMAGE);
            }
        }
        if let Some(img) = self.core.root_image.take() {
            self.backend.release_image(img);
        }

        self.conn
            .composite_unredirect_subwindows(self.root, Redirect::MANUAL)?;
        if let Some(overlay) = self.overlay {
            self.conn.unmap_window(overlay)?;
        }
        self.conn.get_input_focus()?.reply()?;

        self.core.redirected = false;
        self.core.damage.clear();
        info!("Screen unredirected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_delay_stops_immediately() {
        let mut t = UnredirTimer::default();
        assert_eq!(t.decide(true, true, 0, 5), RedirAction::Stop);
    }

    #[test]
    fn condition_loss_rearms_from_scratch() {
        let mut t = UnredirTimer::default();
        // Fullscreen window shows up at t=0 with a 200ms grace delay.
        assert_eq!(t.decide(true, true, 200, 0), RedirAction::None);
        assert_eq!(t.deadline(), Some(200));

        // A second window appears at t=100: timer stops, still redirected.
        assert_eq!(t.decide(false, true, 200, 100), RedirAction::None);
        assert_eq!(t.deadline(), None);

        // It goes away at t=150; the delay starts over.
        assert_eq!(t.decide(true, true, 200, 150), RedirAction::None);
        assert_eq!(t.deadline(), Some(350));

        // Deadline not reached yet.
        assert_eq!(t.decide(true, true, 200, 300), RedirAction::None);

        // At t=350 the condition still holds: actually unredirect.
        assert_eq!(t.decide(true, true, 200, 350), RedirAction::Stop);
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn losing_the_condition_while_unredirected_redirects() {
        let mut t = UnredirTimer::default();
        assert_eq!(t.decide(true, false, 200, 0), RedirAction::None);
        assert_eq!(t.decide(false, false, 200, 50), RedirAction::Start);
    }

    #[test]
    fn deadline_is_exposed_for_the_scheduler() {
        let mut t = UnredirTimer::default();
        t.decide(true, true, 100, 40);
        assert_eq!(t.deadline(), Some(140));
    }
}
