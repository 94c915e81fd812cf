use std::fmt;
use std::fs;
use std::io;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crate::linux;

const ANONYMOUS: u8 = 0;
const HIDDEN: u8 = 1;

/// Process-wide choice of creation strategy.
///
/// Starts on the nameless route and permanently rebinds to dotted files
/// the first time the kernel or filesystem refuses `O_TMPFILE`. The
/// downgrade race is benign: every loser stores the value already there.
struct Selector {
    strategy: AtomicU8,
}

static SELECTOR: Selector = Selector {
    strategy: AtomicU8::new(ANONYMOUS),
};

impl Selector {
    fn begin(&self, dir: &Path, filename: &str) -> io::Result<ProtoFile> {
        fs::create_dir_all(dir)?;
        let dest = dir.join(filename);

        if ANONYMOUS == self.strategy.load(Ordering::Relaxed) {
            match linux::create_anonymous(dir) {
                Ok(file) => {
                    return Ok(ProtoFile {
                        inner: Some(Inner::Anonymous(file)),
                        dest,
                        persisted: false,
                    })
                }
                Err(ref err) if linux::is_anonymous_unsupported(err) => self.downgrade(),
                Err(err) => return Err(err),
            }
        }

        let named = tempfile::Builder::new()
            .prefix(&format!(".{}", filename))
            .tempfile_in(dir)?;
        Ok(ProtoFile {
            inner: Some(Inner::Hidden(named)),
            dest,
            persisted: false,
        })
    }

    /// Stop probing for nameless files, for the rest of the process.
    fn downgrade(&self) {
        self.strategy.store(HIDDEN, Ordering::Relaxed);
    }
}

/// Begin a file that will appear as `dir/filename` once persisted.
///
/// `dir` is created if missing. Until [`ProtoFile::persist`] succeeds,
/// nothing named `filename` exists in `dir`; drop the handle or call
/// [`ProtoFile::discard`] and it never will.
///
/// Where the OS supports it the file is nameless from the start and
/// needs no cleanup at all. Elsewhere it lives as
/// `dir/.filename<random>` until promoted or discarded. The fallback
/// decision is made once and remembered for the whole process.
pub fn proto_file_in<P: AsRef<Path>>(dir: P, filename: &str) -> io::Result<ProtoFile> {
    SELECTOR.begin(dir.as_ref(), filename)
}

enum Inner {
    Anonymous(fs::File),
    Hidden(tempfile::NamedTempFile),
}

/// A file that commits to its name only when you ask it to.
///
/// Write through the ordinary [`Write`] impl, then call exactly one of
/// [`persist`](Self::persist) or [`discard`](Self::discard). Dropping
/// the handle counts as a discard.
pub struct ProtoFile {
    inner: Option<Inner>,
    dest: PathBuf,
    persisted: bool,
}

impl ProtoFile {
    /// The name this file will adopt if persisted. Fixed at creation.
    pub fn final_path(&self) -> &Path {
        &self.dest
    }

    /// Flush to stable storage and materialize under the final name,
    /// replacing any regular file already sitting there.
    ///
    /// Single-call contract: after success the descriptor is closed and
    /// a second call errors. On failure the handle stays usable, so the
    /// caller can still `discard` it.
    pub fn persist(&mut self) -> io::Result<()> {
        self.promote(true)
    }

    /// Like [`persist`](Self::persist), but refuses to replace an
    /// existing `final_path` instead of overwriting it.
    pub fn persist_noclobber(&mut self) -> io::Result<()> {
        self.promote(false)
    }

    fn promote(&mut self, replace: bool) -> io::Result<()> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Err(self.terminal_error()),
        };

        match inner {
            Inner::Anonymous(file) => {
                let linked = file.sync_all().and_then(|()| {
                    if replace {
                        link_or_replace(&file, &self.dest)
                    } else {
                        linux::link_at(&file, &self.dest)
                    }
                });
                if let Err(err) = linked {
                    self.inner = Some(Inner::Anonymous(file));
                    return Err(err);
                }
                // `file` drops here, the one and only close.
            }
            Inner::Hidden(named) => {
                if let Err(err) = named.as_file().sync_all() {
                    self.inner = Some(Inner::Hidden(named));
                    return Err(err);
                }
                let renamed = if replace {
                    named.persist(&self.dest)
                } else {
                    named.persist_noclobber(&self.dest)
                };
                match renamed {
                    // Dropping the returned handle closes the file,
                    // which now lives under its final name.
                    Ok(_file) => (),
                    Err(err) => {
                        self.inner = Some(Inner::Hidden(err.file));
                        return Err(err.error);
                    }
                }
            }
        }

        self.persisted = true;
        Ok(())
    }

    /// Abandon the file, guaranteeing no trace under any name.
    ///
    /// Safe to call any number of times, including after a successful
    /// [`persist`](Self::persist), where it does nothing.
    pub fn discard(&mut self) -> io::Result<()> {
        match self.inner.take() {
            None => Ok(()),
            // Never had a name; closing is the entire cleanup.
            Some(Inner::Anonymous(_file)) => Ok(()),
            Some(Inner::Hidden(named)) => named.close(),
        }
    }

    fn file_mut(&mut self) -> io::Result<&mut fs::File> {
        match self.inner {
            Some(Inner::Anonymous(ref mut file)) => Ok(file),
            Some(Inner::Hidden(ref mut named)) => Ok(named.as_file_mut()),
            None => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            if self.persisted {
                "proto file already persisted"
            } else {
                "proto file already discarded"
            },
        )
    }
}

impl ProtoFile {
    /// Hint that about `num_bytes` are coming, sequentially.
    ///
    /// Best-effort: reserves space and issues readahead advisories when
    /// the file is nameless, does nothing otherwise. Never required for
    /// correctness, and "unsupported" from the OS counts as success.
    pub fn reserve_size(&self, num_bytes: u64) -> io::Result<()> {
        match self.inner {
            Some(Inner::Anonymous(ref file)) => linux::reserve_size(file, num_bytes),
            _ => Ok(()),
        }
    }
}

/// Create-or-replace emulation: if the name is taken by anything but a
/// directory, remove it and link once more. Not an atomic swap; the
/// name is briefly absent.
fn link_or_replace(file: &fs::File, dest: &Path) -> io::Result<()> {
    let occupied = match linux::link_at(file, dest) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => err,
        other => return other,
    };

    match fs::metadata(dest) {
        Ok(ref meta) if !meta.is_dir() => {
            // If the removal fails the retry reports it as EEXIST.
            let _ = fs::remove_file(dest);
            linux::link_at(file, dest)
        }
        _ => Err(occupied),
    }
}

impl fmt::Debug for ProtoFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ProtoFile::{} -> {:?}",
            match self.inner {
                Some(Inner::Anonymous(_)) => "Anonymous",
                Some(Inner::Hidden(_)) => "Hidden",
                None if self.persisted => "Persisted",
                None => "Discarded",
            },
            self.dest
        )
    }
}

impl Write for ProtoFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for ProtoFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}
