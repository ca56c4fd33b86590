//! Terminal stand-in for a browser popup
//!
//! Prints the authorization URL and waits for the user to paste the address
//! the browser was redirected to. End of input counts as closing the popup.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};
use url::Url;

use super::popup::{AuthPopup, AuthWindow, PopupGeometry, PopupLocation};
use crate::error::Result;

/// Authorization "window" for command line use
#[derive(Debug, Default)]
pub struct ConsoleWindow;

impl AuthWindow for ConsoleWindow {
    fn open(&self, url: &Url, _geometry: PopupGeometry) -> Result<Box<dyn AuthPopup>> {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "Open this address in a browser and grant access:\n");
        let _ = writeln!(stderr, "  {}\n", url);
        let _ = writeln!(stderr, "Then paste the address of the page you were sent back to:");
        let _ = stderr.flush();

        let location = Arc::new(Mutex::new(PopupLocation::CrossOrigin));
        let reader_location = location.clone();

        thread::spawn(move || {
            let stdin = io::stdin();
            let mut lines = stdin.lock().lines();
            loop {
                let next = match lines.next() {
                    Some(Ok(line)) => parse_callback_line(&line),
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to read from stdin");
                        Some(PopupLocation::Closed)
                    }
                    None => Some(PopupLocation::Closed),
                };
                if let Some(next) = next {
                    let mut current = reader_location
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    // A close() from the authenticator wins over late input
                    if *current == PopupLocation::CrossOrigin {
                        *current = next;
                    }
                    break;
                }
            }
        });

        Ok(Box::new(ConsolePopup { location }))
    }
}

struct ConsolePopup {
    location: Arc<Mutex<PopupLocation>>,
}

impl AuthPopup for ConsolePopup {
    fn location(&self) -> PopupLocation {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close(&self) {
        debug!("Closing console authorization prompt");
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = PopupLocation::Closed;
    }
}

/// Interpret one pasted line; `None` means ignore it and keep reading
fn parse_callback_line(line: &str) -> Option<PopupLocation> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match Url::parse(line) {
        Ok(url) => Some(PopupLocation::Redirected(url)),
        Err(e) => {
            eprintln!("Not a valid address ({}), try again:", e);
            None
        }
    }
}
