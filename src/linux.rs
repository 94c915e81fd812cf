use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use libc::open64 as open;
use libc::AT_EMPTY_PATH;
use libc::AT_FDCWD;
use libc::AT_SYMLINK_FOLLOW;
use libc::O_CLOEXEC;
use libc::O_TMPFILE;
use libc::O_WRONLY;

/// Reservations at or below this many bytes aren't worth a syscall.
const RESERVE_SIZE_THRESHOLD: u64 = 1 << 15;

/// Largest extent `fallocate` accepts in a single call.
const MAX_EXTENT: u64 = i64::MAX as u64;

/// Whether this process still appears to hold `CAP_DAC_READ_SEARCH`,
/// which `linkat` needs to resolve an empty source path against a bare
/// descriptor. Unprivileged processes usually don't have it; the kernel
/// tells us with `ENOENT`, and once cleared it stays cleared.
static CAP_DAC_READ_SEARCH: AtomicBool = AtomicBool::new(true);

/// Open a nameless, write-only file backed by `dir`'s filesystem.
///
/// The descriptor has no directory entry anywhere; close it and the OS
/// reclaims it, link it with [`link_at`] and it becomes a regular file.
/// Kernels or filesystems without `O_TMPFILE` refuse this with an error
/// [`is_anonymous_unsupported`] recognises.
pub fn create_anonymous<P: AsRef<Path>>(dir: P) -> io::Result<fs::File> {
    create(dir.as_ref())
}

/// True for the errors [`create_anonymous`] yields when `O_TMPFILE` is
/// not available, as opposed to an ordinary failure.
///
/// `EISDIR` and `ENOENT` come from kernels that don't know the flag,
/// `EOPNOTSUPP` from filesystems that don't implement it.
pub fn is_anonymous_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EISDIR) | Some(libc::ENOENT) | Some(libc::EOPNOTSUPP)
    )
}

/// Give an open descriptor a name in the filesystem, `dest`.
///
/// Unlike `fs::hard_link` this doesn't need a source path, so it works
/// on files that have no name at all. The first attempt links the
/// descriptor directly, which needs `CAP_DAC_READ_SEARCH`; without that
/// capability we fall back to linking through `/proc/self/fd`, and
/// remember the downgrade for the rest of the process.
pub fn link_at<P: AsRef<Path>>(file: &fs::File, dest: P) -> io::Result<()> {
    let new_path = cstr(dest.as_ref())?;
    link_fd(file.as_raw_fd(), &new_path)
}

fn link_fd(fd: RawFd, new_path: &CString) -> io::Result<()> {
    if CAP_DAC_READ_SEARCH.load(Ordering::Relaxed) {
        let empty = CString::new("").unwrap();
        if 0 == unsafe {
            libc::linkat(
                fd,
                empty.as_ptr(),
                AT_FDCWD,
                new_path.as_ptr(),
                AT_EMPTY_PATH,
            )
        } {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
        // ENOENT here means the capability check failed in the kernel.
        // Racing threads all store `false`, so a lost swap is fine.
        let _ = CAP_DAC_READ_SEARCH.compare_exchange(
            true,
            false,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    // 'self' is a symlink; one extra resolution, but no privilege needed.
    let old_path = CString::new(format!("/proc/self/fd/{}", fd)).unwrap();
    // The absolute path makes the first argument irrelevant, but passing
    // the descriptor anyway recovers from an inaccessible /proc.
    if 0 == unsafe {
        libc::linkat(
            fd,
            old_path.as_ptr(),
            AT_FDCWD,
            new_path.as_ptr(),
            AT_SYMLINK_FOLLOW,
        )
    } {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Best-effort space reservation plus readahead advisories for a file
/// about to receive `num_bytes` of sequential writes.
///
/// "Unsupported" from the filesystem counts as success; advisory
/// failures are ignored outright.
pub fn reserve_size(file: &fs::File, num_bytes: u64) -> io::Result<()> {
    if num_bytes <= RESERVE_SIZE_THRESHOLD {
        return Ok(());
    }

    let fd = file.as_raw_fd();
    if num_bytes <= MAX_EXTENT {
        let ret = match fallocate(fd, 0, num_bytes as i64) {
            Err(ref err) if err.raw_os_error() == Some(libc::EOPNOTSUPP) => return Ok(()),
            ret => ret,
        };
        advise_sequential(fd, num_bytes as i64);
        return ret;
    }

    // Yes, every exbibyte counts: split the reservation in two.
    match fallocate(fd, 0, i64::MAX) {
        Err(ref err) if err.raw_os_error() == Some(libc::EOPNOTSUPP) => return Ok(()),
        Err(err) => return Err(err),
        Ok(()) => (),
    }
    fallocate(fd, i64::MAX, (num_bytes - MAX_EXTENT) as i64)?;

    // Advisories only cover the first extent; good enough for now.
    advise_sequential(fd, i64::MAX);
    Ok(())
}

fn fallocate(fd: RawFd, offset: i64, len: i64) -> io::Result<()> {
    if 0 == unsafe { libc::fallocate64(fd, 0, offset, len) } {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn advise_sequential(fd: RawFd, len: i64) {
    unsafe {
        libc::posix_fadvise64(fd, 0, len, libc::POSIX_FADV_WILLNEED);
        libc::posix_fadvise64(fd, 0, len, libc::POSIX_FADV_SEQUENTIAL);
    }
}

// Stolen from tempfile / std < 1.6.0.
fn cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contained a null"))
}

fn create(dir: &Path) -> io::Result<fs::File> {
    match unsafe {
        let path = cstr(dir)?;
        open(path.as_ptr(), O_WRONLY | O_CLOEXEC | O_TMPFILE, 0o666)
    } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { fs::File::from_raw_fd(fd) }),
    }
}
