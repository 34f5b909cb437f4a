//! Window title lookup
//!
//! On Windows the top-level windows are enumerated through Win32. Other
//! platforms have no window list, so presence never finds a title there.

use crate::presence::title::WindowDescriptor;

/// Opaque top-level window handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

/// Access to the windowing subsystem
pub trait WindowSource: Send + Sync {
    /// Visible top-level windows with a non-empty title
    fn list(&self) -> Vec<(WindowHandle, String)>;

    /// Current title of `handle`, `None` if the window is gone or untitled
    fn title_of(&self, handle: WindowHandle) -> Option<String>;

    /// First window whose title contains `partial`
    fn find(&self, partial: &str) -> Option<WindowHandle> {
        self.list()
            .into_iter()
            .find(|(_, title)| title.contains(partial))
            .map(|(handle, _)| handle)
    }
}

/// The desktop's real windows
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWindows;

#[cfg(windows)]
impl WindowSource for SystemWindows {
    fn list(&self) -> Vec<(WindowHandle, String)> {
        win32::list()
    }

    fn title_of(&self, handle: WindowHandle) -> Option<String> {
        win32::title_of(windows::Win32::Foundation::HWND(handle.0))
    }
}

#[cfg(not(windows))]
impl WindowSource for SystemWindows {
    fn list(&self) -> Vec<(WindowHandle, String)> {
        Vec::new()
    }

    fn title_of(&self, _handle: WindowHandle) -> Option<String> {
        None
    }
}

#[cfg(windows)]
mod win32 {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetShellWindow, GetWindowTextLengthW, GetWindowTextW, IsWindowVisible,
    };

    use super::WindowHandle;

    pub fn title_of(hwnd: HWND) -> Option<String> {
        let length = unsafe { GetWindowTextLengthW(hwnd) };
        if length <= 0 {
            return None;
        }

        let mut buffer = vec![0u16; length as usize + 1];
        let copied = unsafe { GetWindowTextW(hwnd, &mut buffer) };
        if copied <= 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buffer[..copied as usize]))
    }

    struct Enumeration {
        shell: HWND,
        windows: Vec<(WindowHandle, String)>,
    }

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let state = &mut *(lparam.0 as *mut Enumeration);
        if hwnd != state.shell && IsWindowVisible(hwnd).as_bool() {
            if let Some(title) = title_of(hwnd) {
                state.windows.push((WindowHandle(hwnd.0), title));
            }
        }
        BOOL(1)
    }

    pub fn list() -> Vec<(WindowHandle, String)> {
        let mut state = Enumeration {
            shell: unsafe { GetShellWindow() },
            windows: Vec::new(),
        };
        let lparam = LPARAM(&mut state as *mut Enumeration as isize);
        if let Err(e) = unsafe { EnumWindows(Some(collect), lparam) } {
            tracing::warn!("EnumWindows failed: {}", e);
        }
        state.windows
    }
}

/// The player window being followed, with its last seen title
pub struct TrackedWindow {
    descriptor: WindowDescriptor,
    handle: Option<WindowHandle>,
    title: Option<String>,
}

impl TrackedWindow {
    pub fn new(descriptor: WindowDescriptor) -> Self {
        Self {
            descriptor,
            handle: None,
            title: None,
        }
    }

    /// Refresh the title.
    ///
    /// Re-reads the known handle first and only searches by partial title
    /// when that handle no longer has a title. Returns true when a title is
    /// available and differs from the previous one.
    pub fn update(&mut self, windows: &dyn WindowSource) -> bool {
        let mut title = self.handle.and_then(|handle| windows.title_of(handle));
        if title.is_none() {
            self.handle = windows.find(self.descriptor.partial_title());
            title = self.handle.and_then(|handle| windows.title_of(handle));
            if title.is_none() {
                self.title = None;
                return false;
            }
        }

        if self.title != title {
            self.title = title;
            return true;
        }
        false
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// The title with the player decoration removed
    pub fn track(&self) -> Option<String> {
        self.title.as_deref().map(|title| self.descriptor.truncate(title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::title::Truncation;
    use crate::testing::FakeWindows;

    fn foobar() -> WindowDescriptor {
        WindowDescriptor::new("[foobar2000]", Truncation::End, 13)
    }

    #[test]
    fn test_finds_by_partial_title() {
        let windows = FakeWindows::new();
        windows.set(1, "Inbox - Mail");
        windows.set(2, "Artist - Song [foobar2000]");

        let mut tracked = TrackedWindow::new(foobar());
        assert!(tracked.update(windows.as_ref()));
        assert_eq!(tracked.track().as_deref(), Some("Artist - Song"));
        assert!(!tracked.update(windows.as_ref()));
    }

    #[test]
    fn test_rereads_same_handle() {
        let windows = FakeWindows::new();
        windows.set(2, "Artist - Song [foobar2000]");
        let mut tracked = TrackedWindow::new(foobar());
        tracked.update(windows.as_ref());

        // Paused players often drop the suffix; the handle is still followed
        windows.set(2, "foobar v2.1");
        assert!(tracked.update(windows.as_ref()));
        assert_eq!(tracked.title(), Some("foobar v2.1"));
    }

    #[test]
    fn test_reresolves_when_window_closes() {
        let windows = FakeWindows::new();
        windows.set(2, "Artist - Song [foobar2000]");
        let mut tracked = TrackedWindow::new(foobar());
        tracked.update(windows.as_ref());

        windows.close(2);
        assert!(!tracked.update(windows.as_ref()));
        assert_eq!(tracked.title(), None);

        windows.set(7, "Other - Tune [foobar2000]");
        assert!(tracked.update(windows.as_ref()));
        assert_eq!(tracked.track().as_deref(), Some("Other - Tune"));
    }

    #[test]
    fn test_no_window() {
        let windows = FakeWindows::new();
        let mut tracked = TrackedWindow::new(foobar());
        assert!(!tracked.update(windows.as_ref()));
        assert!(tracked.track().is_none());
    }
}
