/// Process and window utilities used by the state machines.
///
/// Every operation reports failure as a value ("not found", `None`, `false`)
/// so callers can simply retry on their next poll.
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use sysinfo::{ProcessesToUpdate, System};

/// Opaque top-level window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub isize);

pub trait ProcessUtils: Send + Sync {
    /// Ids of every running process whose executable name matches `name`
    /// (case-insensitive).
    fn find_all_by_name(&self, name: &str) -> HashSet<u32>;

    /// First visible top-level window owned by one of `pids` whose title or
    /// class equals `title_or_class` (case-insensitive).  An empty
    /// `title_or_class` matches any visible window.
    fn get_window(&self, pids: &HashSet<u32>, title_or_class: &str) -> Option<WindowHandle>;

    /// Spawns `command` detached and returns its process id.
    fn start(&self, command: &str, args: &[String]) -> Option<u32>;

    /// Terminates every process named `name`.  Returns how many were killed.
    fn kill(&self, name: &str) -> Result<usize>;

    /// Restores and brings `window` to the foreground.
    fn focus(&self, window: WindowHandle) -> bool;
}

/// Live implementation backed by `sysinfo` and, on Windows, the window manager.
pub struct SystemProcesses {
    sys: Mutex<System>,
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl ProcessUtils for SystemProcesses {
    fn find_all_by_name(&self, name: &str) -> HashSet<u32> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .iter()
            .filter(|(_, p)| p.name().to_string_lossy().eq_ignore_ascii_case(name))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn get_window(&self, pids: &HashSet<u32>, title_or_class: &str) -> Option<WindowHandle> {
        if pids.is_empty() {
            return None;
        }
        #[cfg(windows)]
        {
            imp::find_window(pids, title_or_class)
        }
        #[cfg(not(windows))]
        {
            let _ = title_or_class;
            None
        }
    }

    fn start(&self, command: &str, args: &[String]) -> Option<u32> {
        match std::process::Command::new(command).args(args).spawn() {
            Ok(child) => {
                tracing::info!(command, pid = child.id(), "Process started");
                Some(child.id())
            }
            Err(e) => {
                tracing::warn!(command, "Failed to start process: {e}");
                None
            }
        }
    }

    fn kill(&self, name: &str) -> Result<usize> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        let mut failed = 0;
        for process in sys.processes().values() {
            if !process.name().to_string_lossy().eq_ignore_ascii_case(name) {
                continue;
            }
            if process.kill() {
                killed += 1;
            } else {
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("Failed to kill {failed} of {} '{name}' processes", killed + failed);
        }
        if killed > 0 {
            tracing::info!(name, killed, "Process killed");
        }
        Ok(killed)
    }

    fn focus(&self, window: WindowHandle) -> bool {
        #[cfg(windows)]
        {
            imp::focus(window)
        }
        #[cfg(not(windows))]
        {
            let _ = window;
            false
        }
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::collections::HashSet;

    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetClassNameW, GetWindowTextW, GetWindowThreadProcessId, IsIconic,
        IsWindowVisible, SetForegroundWindow, ShowWindow, SW_RESTORE,
    };

    use super::WindowHandle;

    struct Search<'a> {
        pids: &'a HashSet<u32>,
        needle: &'a str,
        found: Option<HWND>,
    }

    fn text_of(buf: &[u16], len: i32) -> String {
        let len = usize::try_from(len).unwrap_or(0).min(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    unsafe extern "system" fn visit(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut Search<'_>);
        if !IsWindowVisible(hwnd).as_bool() {
            return BOOL(1);
        }

        let mut pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        if !search.pids.contains(&pid) {
            return BOOL(1);
        }

        if !search.needle.is_empty() {
            let mut buf = [0u16; 256];
            let len = GetWindowTextW(hwnd, &mut buf);
            let title = text_of(&buf, len);
            let len = GetClassNameW(hwnd, &mut buf);
            let class = text_of(&buf, len);
            if !title.eq_ignore_ascii_case(search.needle)
                && !class.eq_ignore_ascii_case(search.needle)
            {
                return BOOL(1);
            }
        }

        search.found = Some(hwnd);
        BOOL(0)
    }

    pub fn find_window(pids: &HashSet<u32>, title_or_class: &str) -> Option<WindowHandle> {
        let mut search = Search {
            pids,
            needle: title_or_class,
            found: None,
        };
        unsafe {
            // EnumWindows reports an error when the callback stops early; the
            // result is carried in `search.found` instead.
            let _ = EnumWindows(Some(visit), LPARAM(&mut search as *mut Search<'_> as isize));
        }
        search.found.map(|hwnd| WindowHandle(hwnd.0))
    }

    pub fn focus(window: WindowHandle) -> bool {
        let hwnd = HWND(window.0);
        unsafe {
            if IsIconic(hwnd).as_bool() {
                let _ = ShowWindow(hwnd, SW_RESTORE);
            }
            SetForegroundWindow(hwnd).as_bool()
        }
    }
}
