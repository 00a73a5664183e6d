// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windows channel: a mailslot, plus a manual-reset event as the signal.
//!
//! The event and the send handle are created inheritable so that a worker started with handle
//! inheritance can use the raw values published in the handshake link.

use super::{ChannelIdentity, ChannelNamespace};
use crate::shared::handshake::RawId;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::time::Duration;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, GENERIC_WRITE, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, OPEN_EXISTING,
};
use windows::Win32::System::Mailslots::{CreateMailslotW, GetMailslotInfo, MAILSLOT_WAIT_FOREVER};
use windows::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForSingleObject, INFINITE,
};

const MAILSLOT_NO_MESSAGE: u32 = u32::MAX;

fn inheritable() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: true.into(),
    }
}

fn mailslot_path(identity: &ChannelIdentity) -> HSTRING {
    HSTRING::from(format!(r"\\.\mailslot\{}", identity.name()))
}

fn to_handle(id: RawId) -> HANDLE {
    HANDLE(id as *mut c_void)
}

struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        // SAFETY: we own the handle and close it once.
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            tracing::warn!(error = %e, "Failed to close channel handle");
        }
    }
}

pub(crate) struct Receiver {
    mailslot: Handle,
    path: HSTRING,
}

impl Receiver {
    pub(crate) fn create(
        identity: &ChannelIdentity,
        namespace: &ChannelNamespace,
    ) -> io::Result<Self> {
        if let ChannelNamespace::Directory(dir) = namespace {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("Mailslots can't live in a directory: {}", dir.display()),
            ));
        }
        let path = mailslot_path(identity);
        // SAFETY: path is a valid, NUL-terminated wide string.
        let mailslot = unsafe { CreateMailslotW(&path, 0, MAILSLOT_WAIT_FOREVER, None) }
            .map_err(io::Error::from)?;
        Ok(Self {
            mailslot: Handle(mailslot),
            path,
        })
    }

    pub(crate) fn open_sender(&self) -> io::Result<Sender> {
        let sa = inheritable();
        // SAFETY: the mailslot exists for as long as self does.
        let handle = unsafe {
            CreateFileW(
                &self.path,
                GENERIC_WRITE.0,
                FILE_SHARE_READ,
                Some(&sa),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                None,
            )
        }
        .map_err(io::Error::from)?;
        Ok(Sender {
            handle: Handle(handle),
        })
    }

    pub(crate) fn next_message_size(&self) -> io::Result<Option<usize>> {
        let mut next = 0u32;
        // SAFETY: out-pointer to a local.
        unsafe {
            GetMailslotInfo(
                self.mailslot.0,
                None,
                Some(ptr::addr_of_mut!(next)),
                None,
                None,
            )
        }
        .map_err(io::Error::from)?;
        Ok((next != MAILSLOT_NO_MESSAGE).then_some(next as usize))
    }

    pub(crate) fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0u32;
        // SAFETY: buf and read are valid for the duration of this synchronous call.
        unsafe { ReadFile(self.mailslot.0, Some(buf), Some(&mut read as *mut u32), None) }
            .map_err(io::Error::from)?;
        Ok(read as usize)
    }
}

pub(crate) struct Sender {
    handle: Handle,
}

impl Sender {
    pub(crate) fn raw_id(&self) -> RawId {
        self.handle.0 .0 as RawId
    }
}

/// An inheritable manual-reset event, initially unset.
pub(crate) struct Signal {
    event: Handle,
}

impl Signal {
    pub(crate) fn create() -> io::Result<Self> {
        let sa = inheritable();
        // SAFETY: plain event creation, unnamed.
        let event = unsafe { CreateEventW(Some(&sa), true, false, PCWSTR::null()) }
            .map_err(io::Error::from)?;
        Ok(Self {
            event: Handle(event),
        })
    }

    pub(crate) fn worker_id(&self) -> RawId {
        self.event.0 .0 as RawId
    }

    pub(crate) fn reset(&self) -> io::Result<()> {
        // SAFETY: we own the event.
        unsafe { ResetEvent(self.event.0) }.map_err(io::Error::from)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let timeout_ms = timeout.as_millis().min((INFINITE - 1) as u128) as u32;
        // SAFETY: we own the event.
        let result = unsafe { WaitForSingleObject(self.event.0, timeout_ms) };
        if result == WAIT_OBJECT_0 {
            Ok(true)
        } else if result == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

// Worker side.  Runs inside a vectored exception handler: no allocation, no locks.

pub(crate) fn send_message(sender: RawId, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0u32;
    // SAFETY: bytes and written outlive this synchronous call; a stale handle fails cleanly.
    unsafe {
        WriteFile(
            to_handle(sender),
            Some(bytes),
            Some(&mut written as *mut u32),
            None,
        )
    }
    .map_err(io::Error::from)
}

pub(crate) fn set_signal(signal: RawId) -> io::Result<()> {
    // SAFETY: see send_message.
    unsafe { SetEvent(to_handle(signal)) }.map_err(io::Error::from)
}
