//! Files that are writable but invisible until you give them a name.
//!
//! A [`ProtoFile`] delays the commitment an ordinary `File::create`
//! makes up front: nothing appears under the final name until
//! [`ProtoFile::persist`], and abandoning the handle leaves no trace in
//! the directory. That makes half-written downloads, build artifacts
//! and cache entries impossible to observe, and crash cleanup mostly
//! unnecessary.
//!
//! On Linux the file starts out truly nameless (`O_TMPFILE`) and is
//! linked into place by descriptor; where that's unavailable a hidden,
//! uniquely-named file plus rename does the same job, chosen once per
//! process.
//!
//! ```no_run
//! use std::io::Write;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut file = protofile::proto_file_in("downloads", "video.mkv")?;
//! file.write_all(b"...")?;
//! file.persist()?;
//! # Ok(())
//! # }
//! ```

#[cfg(target_os = "linux")]
mod linux;

#[cfg(not(target_os = "linux"))]
mod linux {
    //! Portable stand-ins: nameless files are reported as unsupported,
    //! which sends every caller down the hidden-file route.

    use std::fs;
    use std::io;
    use std::path::Path;

    pub fn create_anonymous<P: AsRef<Path>>(_dir: P) -> io::Result<fs::File> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn is_anonymous_unsupported(err: &io::Error) -> bool {
        io::ErrorKind::Unsupported == err.kind()
    }

    pub fn link_at<P: AsRef<Path>>(_file: &fs::File, _dest: P) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn reserve_size(_file: &fs::File, _num_bytes: u64) -> io::Result<()> {
        Ok(())
    }
}

mod proto;

pub use crate::linux::create_anonymous;
pub use crate::linux::is_anonymous_unsupported;
pub use crate::linux::link_at;
pub use crate::proto::proto_file_in;
pub use crate::proto::ProtoFile;
