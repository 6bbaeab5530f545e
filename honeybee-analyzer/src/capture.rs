//! Read-side interface to the Honeybee capture driver.
//!
//! The driver programs the PT MSRs and fills a per-CPU ring of ToPA
//! buffers; this module speaks its ioctl surface and maps the trace
//! buffer into the consumer. Tracing must be disabled on the session's
//! CPU before the buffer is read.

use std::{fs::File, io, os::fd::AsRawFd, path::Path, ptr};

use honeybee_decoder::terminate_trace_buffer;
use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

const DRIVER_PATH: &str = "/dev/honey_driver";

const IOC_MAGIC: u64 = 0xAB;

/// The kernel's `_IOR` encoding: direction `read` (2), a 14-bit argument
/// size, the driver magic, and the request number.
const fn ior<T>(nr: u64) -> u64 {
    (2 << 30) | ((size_of::<T>() as u64) << 16) | (IOC_MAGIC << 8) | nr
}

#[repr(C)]
struct ConfigureBuffers {
    count: u32,
    page_count_power: u8,
}

#[repr(C)]
struct SetEnabled {
    cpu_id: u16,
    enabled: u8,
    reset_output: u8,
}

/// One address-range filter. Code in `[start, stop)` is traced; with
/// `enabled` zero the addresses are ignored.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeFilter {
    /// Start of the range, inclusive
    pub start: u64,
    /// End of the range, exclusive
    pub stop: u64,
    /// Non-zero to apply this filter
    pub enabled: u8,
}

/// Number of filter slots in the configure-trace packet. Hardware honours
/// only its first n of these.
pub const RANGE_FILTER_COUNT: usize = 4;

#[repr(C)]
struct ConfigureTrace {
    cpu_id: u16,
    filters: [RangeFilter; RANGE_FILTER_COUNT],
    pid: u64,
}

#[repr(C)]
struct GetTraceLengths {
    cpu_id: u16,
    trace_packet_byte_count_out: *mut u64,
    trace_buffer_length_out: *mut u64,
}

const IOC_CONFIGURE_BUFFERS: u64 = ior::<ConfigureBuffers>(1);
const IOC_SET_ENABLED: u64 = ior::<SetEnabled>(2);
const IOC_CONFIGURE_TRACE: u64 = ior::<ConfigureTrace>(3);
const IOC_GET_TRACE_LENGTHS: u64 = ior::<GetTraceLengths>(4);

/// Error for capture sessions
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    /// The driver device could not be opened
    #[error("Could not open {DRIVER_PATH}")]
    OpenDriver(#[source] io::Error),
    /// An ioctl was rejected
    #[error("Driver request failed")]
    Ioctl(#[source] io::Error),
    /// The trace buffer could not be mapped
    #[error("Could not map the trace buffer")]
    Map(#[source] io::Error),
}

/// A capture session bound to one CPU.
///
/// Nothing prevents opening two sessions on the same CPU; it is just a
/// bad idea.
pub struct CaptureSession {
    cpu_id: u16,
    driver: File,
    buffer: Option<MmapMut>,
}

impl CaptureSession {
    /// Open the driver for `cpu_id`.
    pub fn new(cpu_id: u16) -> Result<Self, CaptureError> {
        let driver = File::options()
            .read(true)
            .write(true)
            .open(Path::new(DRIVER_PATH))
            .map_err(CaptureError::OpenDriver)?;
        Ok(Self {
            cpu_id,
            driver,
            buffer: None,
        })
    }

    fn ioctl<T>(&self, request: u64, packet: &mut T) -> Result<(), CaptureError> {
        // SAFETY: each request constant is paired with the packet type it
        // was encoded from, mirroring the driver's contract
        let result = unsafe {
            libc::ioctl(
                self.driver.as_raw_fd(),
                request as libc::c_ulong,
                ptr::from_mut(packet),
            )
        };
        if result < 0 {
            return Err(CaptureError::Ioctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// (Re)allocate `count` ToPA buffers of `PAGE_SIZE << page_count_power`
    /// bytes per CPU. Invalid while any CPU is tracing; any existing
    /// mapping of the old buffers is dropped.
    pub fn configure_buffers(
        &mut self,
        count: u32,
        page_count_power: u8,
    ) -> Result<(), CaptureError> {
        self.buffer = None;
        let mut packet = ConfigureBuffers {
            count,
            page_count_power,
        };
        self.ioctl(IOC_CONFIGURE_BUFFERS, &mut packet)
    }

    /// Start or stop tracing on this session's CPU. `reset_output` rewinds
    /// the buffer write head; resuming without it keeps earlier data.
    pub fn set_enabled(&mut self, enabled: bool, reset_output: bool) -> Result<(), CaptureError> {
        let mut packet = SetEnabled {
            cpu_id: self.cpu_id,
            enabled: u8::from(enabled),
            reset_output: u8::from(reset_output),
        };
        self.ioctl(IOC_SET_ENABLED, &mut packet)
    }

    /// Bind tracing to `pid`'s address space and apply up to
    /// [`RANGE_FILTER_COUNT`] range filters. Only valid while the CPU is
    /// not tracing. Put the filters that matter most first.
    pub fn configure_tracing(
        &mut self,
        pid: u32,
        filters: [RangeFilter; RANGE_FILTER_COUNT],
    ) -> Result<(), CaptureError> {
        let mut packet = ConfigureTrace {
            cpu_id: self.cpu_id,
            filters,
            pid: u64::from(pid),
        };
        self.ioctl(IOC_CONFIGURE_TRACE, &mut packet)
    }

    fn trace_lengths(&self) -> Result<(u64, u64), CaptureError> {
        let mut packet_bytes = 0u64;
        let mut buffer_bytes = 0u64;
        let mut packet = GetTraceLengths {
            cpu_id: self.cpu_id,
            trace_packet_byte_count_out: &raw mut packet_bytes,
            trace_buffer_length_out: &raw mut buffer_bytes,
        };
        self.ioctl(IOC_GET_TRACE_LENGTHS, &mut packet)?;
        Ok((packet_bytes, buffer_bytes))
    }

    /// Fetch the captured trace, stop-codon terminated, ready for a
    /// decoder. Only valid while the CPU is not tracing.
    ///
    /// The returned slice borrows the session's buffer mapping; it is
    /// invalidated by [`configure_buffers`][Self::configure_buffers] and
    /// by dropping the session. If the trace exactly filled the buffer the
    /// final packet is truncated to make room for the codon.
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn terminated_trace(&mut self) -> Result<&[u8], CaptureError> {
        let (packet_bytes, buffer_bytes) = self.trace_lengths()?;

        let buffer = match self.buffer {
            Some(ref mut buffer) => buffer,
            None => {
                // SAFETY: sysconf has no memory effects
                let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
                // The driver vends every CPU's buffer from one device
                // node, keyed by page-aligned offset
                let offset = page_size * u64::from(self.cpu_id);
                // SAFETY: check the safety requirements of memmap2
                // documentation; the driver keeps the buffer alive while
                // the fd is open
                let map = unsafe {
                    MmapOptions::new()
                        .offset(offset)
                        .len(buffer_bytes as usize)
                        .map_mut(&self.driver)
                }
                .map_err(CaptureError::Map)?;
                self.buffer.insert(map)
            }
        };

        log::debug!(
            "CPU {}: {packet_bytes} packet bytes in a {buffer_bytes} byte buffer",
            self.cpu_id,
        );
        Ok(terminate_trace_buffer(buffer, packet_bytes as usize))
    }
}
