//! Event Tracing for Windows backend.
use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::slice;

use anyhow::{bail, Context, Result};
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::{ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_SUCCESS, WIN32_ERROR};
use windows::Win32::System::Diagnostics::Etw::{
    CloseTrace, ControlTraceW, EnableTraceEx2, OpenTraceW, ProcessTrace, StartTraceW,
    CONTROLTRACE_HANDLE, EVENT_CONTROL_CODE_DISABLE_PROVIDER, EVENT_CONTROL_CODE_ENABLE_PROVIDER,
    EVENT_RECORD, EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_LOGFILEW, EVENT_TRACE_PROPERTIES,
    EVENT_TRACE_REAL_TIME_MODE, PROCESSTRACE_HANDLE, PROCESS_TRACE_MODE_EVENT_RECORD,
    PROCESS_TRACE_MODE_REAL_TIME, TRACE_LEVEL_INFORMATION, WNODE_FLAG_TRACED_GUID,
};

use super::{ConsumerHandle, Guid, Provider, RecordHeader, RecordSink, TraceBackend, TracePump};

/// Room reserved after the properties block for the session name.
const NAME_CAPACITY: usize = 1024;
const INVALID_PROCESSTRACE_HANDLE: u64 = u64::MAX;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// EVENT_TRACE_PROPERTIES followed by space for the logger name, 8-byte
/// aligned.
struct Properties {
    buf: Vec<u64>,
}

impl Properties {
    fn new() -> Self {
        let bytes = mem::size_of::<EVENT_TRACE_PROPERTIES>() + NAME_CAPACITY * 2;
        let mut props = Self {
            buf: vec![0u64; bytes.div_ceil(8)],
        };
        let p = props.as_mut_ptr();
        unsafe {
            (*p).Wnode.BufferSize = (props.buf.len() * 8) as u32;
            (*p).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
            (*p).Wnode.ClientContext = 1; // QPC timestamps
            (*p).LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
            (*p).LoggerNameOffset = mem::size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        }
        props
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buf.as_mut_ptr().cast()
    }
}

#[derive(Default)]
pub struct EtwBackend {
    session: Option<CONTROLTRACE_HANDLE>,
    name: Vec<u16>,
}

impl EtwBackend {
    fn start_trace(&mut self) -> WIN32_ERROR {
        let mut handle = CONTROLTRACE_HANDLE::default();
        let mut props = Properties::new();
        let err = unsafe { StartTraceW(&mut handle, PCWSTR(self.name.as_ptr()), props.as_mut_ptr()) };
        if err == ERROR_SUCCESS {
            self.session = Some(handle);
        }
        err
    }

    fn stop_by_name(&self) -> WIN32_ERROR {
        let mut props = Properties::new();
        unsafe {
            ControlTraceW(
                CONTROLTRACE_HANDLE::default(),
                PCWSTR(self.name.as_ptr()),
                props.as_mut_ptr(),
                EVENT_TRACE_CONTROL_STOP,
            )
        }
    }

    fn session(&self) -> Result<CONTROLTRACE_HANDLE> {
        self.session.context("Trace session is not open")
    }
}

impl TraceBackend for EtwBackend {
    fn open_session(&mut self, name: &str) -> Result<()> {
        self.name = wide(name);
        let mut err = self.start_trace();
        if err == ERROR_ALREADY_EXISTS {
            // Left over from a previous run that did not shut down cleanly.
            tracing::warn!(session = name, "Replacing stale trace session");
            let stopped = self.stop_by_name();
            if stopped != ERROR_SUCCESS {
                tracing::warn!(session = name, "Failed to stop stale session: {stopped:?}");
            }
            err = self.start_trace();
        }
        if err != ERROR_SUCCESS {
            bail!("StartTrace({name}) failed: {err:?}");
        }
        tracing::debug!(session = name, "Trace session opened");
        Ok(())
    }

    fn enable_provider(&mut self, provider: &Provider) -> Result<()> {
        let session = self.session()?;
        let guid = GUID::from_u128(provider.guid.0);
        let err = unsafe {
            EnableTraceEx2(
                session,
                &guid,
                EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                TRACE_LEVEL_INFORMATION as u8,
                provider.keywords,
                0,
                0,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            bail!("EnableTraceEx2({}) failed: {err:?}", provider.name);
        }
        tracing::debug!(provider = provider.name, "Provider enabled");
        Ok(())
    }

    fn disable_provider(&mut self, provider: &Provider) {
        let Some(session) = self.session else {
            return;
        };
        let guid = GUID::from_u128(provider.guid.0);
        let err = unsafe {
            EnableTraceEx2(
                session,
                &guid,
                EVENT_CONTROL_CODE_DISABLE_PROVIDER,
                0,
                0,
                0,
                0,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            tracing::warn!(provider = provider.name, "Failed to disable provider: {err:?}");
        }
    }

    fn open_consumer(&mut self, name: &str) -> Result<(Box<dyn TracePump>, ConsumerHandle)> {
        self.session()?;
        let mut pump = Box::new(EtwPump {
            handle: PROCESSTRACE_HANDLE {
                Value: INVALID_PROCESSTRACE_HANDLE,
            },
            slot: Box::new(SinkSlot { sink: None }),
            name: wide(name),
        });

        let mut logfile = EVENT_TRACE_LOGFILEW {
            LoggerName: PWSTR(pump.name.as_mut_ptr()),
            Context: (&mut *pump.slot as *mut SinkSlot).cast::<c_void>(),
            ..Default::default()
        };
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(on_record);

        let handle = unsafe { OpenTraceW(&mut logfile) };
        if handle.Value == INVALID_PROCESSTRACE_HANDLE {
            bail!("OpenTrace({name}) failed: {}", std::io::Error::last_os_error());
        }
        pump.handle = handle;
        Ok((pump, ConsumerHandle(handle.Value)))
    }

    fn stop_session(&mut self) {
        let Some(session) = self.session else {
            return;
        };
        let mut props = Properties::new();
        let err = unsafe {
            ControlTraceW(session, PCWSTR::null(), props.as_mut_ptr(), EVENT_TRACE_CONTROL_STOP)
        };
        if err != ERROR_SUCCESS {
            tracing::warn!("Failed to stop trace session: {err:?}");
        }
    }

    fn close(&mut self) {
        self.session = None;
    }
}

struct SinkSlot {
    sink: Option<RecordSink>,
}

struct EtwPump {
    handle: PROCESSTRACE_HANDLE,
    /// Target of the consumer's context pointer; must stay put until the
    /// handle is closed.
    slot: Box<SinkSlot>,
    name: Vec<u16>,
}

unsafe impl Send for EtwPump {}

impl TracePump for EtwPump {
    fn run(mut self: Box<Self>, sink: RecordSink) -> Result<()> {
        self.slot.sink = Some(sink);
        let err = unsafe { ProcessTrace(&[self.handle], None, None) };
        match err {
            ERROR_SUCCESS | ERROR_CANCELLED => Ok(()),
            err => bail!("ProcessTrace failed: {err:?}"),
        }
    }
}

impl Drop for EtwPump {
    fn drop(&mut self) {
        if self.handle.Value != INVALID_PROCESSTRACE_HANDLE {
            unsafe {
                let _ = CloseTrace(self.handle);
            }
        }
    }
}

unsafe extern "system" fn on_record(record: *mut EVENT_RECORD) {
    let Some(record) = record.as_ref() else {
        return;
    };
    let Some(slot) = record.UserContext.cast::<SinkSlot>().as_mut() else {
        return;
    };
    let Some(sink) = slot.sink.as_mut() else {
        return;
    };

    let h = &record.EventHeader;
    let header = RecordHeader {
        provider: Guid(h.ProviderId.to_u128()),
        id: h.EventDescriptor.Id,
        version: h.EventDescriptor.Version,
        opcode: h.EventDescriptor.Opcode,
        task: h.EventDescriptor.Task,
        process_id: h.ProcessId,
    };
    let data: &[u8] = if record.UserData.is_null() || record.UserDataLength == 0 {
        &[]
    } else {
        slice::from_raw_parts(record.UserData.cast::<u8>(), usize::from(record.UserDataLength))
    };

    // Unwinding across the OS callback boundary is undefined.
    if panic::catch_unwind(AssertUnwindSafe(|| sink(&header, data))).is_err() {
        tracing::error!("Panic while handling trace record {header:?}");
    }
}
