//! Authorization popup abstraction
//!
//! The host application owns the actual window. The authenticator only needs
//! to open a popup at a URL, read back where it navigated to (which fails
//! while it is on the provider's origin), and close it.

use url::Url;

use crate::error::Result;

const MAX_POPUP_WIDTH: u32 = 750;
const MAX_POPUP_HEIGHT: u32 = 1000;

/// What the authenticator can observe about an open popup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupLocation {
    /// Still on the provider's pages; location unreadable
    CrossOrigin,
    /// The user closed the popup
    Closed,
    /// Back on the host's origin at this URL
    Redirected(Url),
}

/// A popup window opened by [`AuthWindow::open`]
pub trait AuthPopup: Send + Sync {
    fn location(&self) -> PopupLocation;

    /// Close the popup; must be safe to call more than once
    fn close(&self);
}

/// Outer geometry of the host window and the screen it is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFrame {
    pub screen_width: u32,
    pub screen_height: u32,
    pub outer_x: i32,
    pub outer_y: i32,
    pub outer_width: u32,
    pub outer_height: u32,
}

impl Default for WindowFrame {
    fn default() -> Self {
        Self {
            screen_width: 1920,
            screen_height: 1080,
            outer_x: 0,
            outer_y: 0,
            outer_width: 1920,
            outer_height: 1080,
        }
    }
}

/// Requested popup size and position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupGeometry {
    pub width: u32,
    pub height: u32,
    pub left: i32,
    pub top: i32,
}

impl PopupGeometry {
    /// At most 750x1000, centered over the host window
    pub fn centered(frame: WindowFrame) -> Self {
        let width = frame.screen_width.min(MAX_POPUP_WIDTH);
        let height = frame.screen_height.min(MAX_POPUP_HEIGHT);
        let left = frame.outer_x + (frame.outer_width as i32 - width as i32) / 2;
        let top = frame.outer_y + (frame.outer_height as i32 - height as i32) / 2;
        Self {
            width,
            height,
            left,
            top,
        }
    }
}

/// Host capability to show authorization popups
pub trait AuthWindow: Send + Sync {
    /// Open a popup pointed at `url`
    fn open(&self, url: &Url, geometry: PopupGeometry) -> Result<Box<dyn AuthPopup>>;

    /// Current geometry of the host window
    fn frame(&self) -> WindowFrame {
        WindowFrame::default()
    }
}

/// Closes the wrapped popup when dropped, unless the user already closed it
pub(crate) struct PopupGuard {
    popup: Box<dyn AuthPopup>,
    closed_by_user: bool,
}

impl PopupGuard {
    pub(crate) fn new(popup: Box<dyn AuthPopup>) -> Self {
        Self {
            popup,
            closed_by_user: false,
        }
    }

    pub(crate) fn location(&mut self) -> PopupLocation {
        let location = self.popup.location();
        if location == PopupLocation::Closed {
            self.closed_by_user = true;
        }
        location
    }
}

impl Drop for PopupGuard {
    fn drop(&mut self) {
        if !self.closed_by_user {
            self.popup.close();
        }
    }
}
