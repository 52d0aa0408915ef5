//! Filesystem descriptors rooted at preopened host directories.
//!
//! A [`Descriptor`] is either an open file or an open directory. Directory
//! descriptors remember the preopen they were reached from and resolve every
//! `*_at` path against it lexically (see `path`), so no path can name
//! anything outside the preopen. Bulk data moves through streams fed by the
//! filesystem worker; metadata operations run on tokio's blocking pool.

mod error;
mod path;
mod worker;

pub use self::error::{ErrorCode, FsError, FsResult};

use self::path::{GuestPath, has_trailing_separator};
use self::worker::{FsRequest, ROUTER};
use crate::future::FutureReader;
use crate::runtime::spawn_blocking;
use crate::stream::{StreamReader, stream_pair};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

bitflags::bitflags! {
    /// Permission bits for operating on a file.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FilePerms: usize {
        const READ = 0b1;
        const WRITE = 0b10;
    }
}

bitflags::bitflags! {
    /// Permission bits for operating on a directory.
    ///
    /// Directories can be limited to being readonly. This will restrict what
    /// can be done with them, for example preventing creation of new files.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DirPerms: usize {
        /// This directory can be read, for example its entries can be iterated
        /// over and files can be opened.
        const READ = 0b1;

        /// This directory can be mutated, for example by creating new files
        /// within it.
        const MUTATE = 0b10;
    }
}

bitflags::bitflags! {
    /// The mode a descriptor was opened under. Needed to report
    /// [`DescriptorFlags`] since the OS flags cannot be read back portably.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpenMode: usize {
        const READ = 0b1;
        const WRITE = 0b10;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PathFlags: u32 {
        const SYMLINK_FOLLOW = 0b1;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREATE = 0b1;
        const DIRECTORY = 0b10;
        const EXCLUSIVE = 0b100;
        const TRUNCATE = 0b1000;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        const READ = 0b1;
        const WRITE = 0b10;
        const FILE_INTEGRITY_SYNC = 0b100;
        const DATA_INTEGRITY_SYNC = 0b1000;
        const REQUESTED_WRITE_SYNC = 0b10000;
        const MUTATE_DIRECTORY = 0b100000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Unknown,
    BlockDevice,
    CharacterDevice,
    Directory,
    Fifo,
    SymbolicLink,
    RegularFile,
    Socket,
}

impl From<cap_std::fs::FileType> for DescriptorType {
    fn from(ft: cap_std::fs::FileType) -> Self {
        use cap_fs_ext::FileTypeExt;
        if ft.is_dir() {
            DescriptorType::Directory
        } else if ft.is_symlink() {
            DescriptorType::SymbolicLink
        } else if ft.is_block_device() {
            DescriptorType::BlockDevice
        } else if ft.is_char_device() {
            DescriptorType::CharacterDevice
        } else if ft.is_file() {
            DescriptorType::RegularFile
        } else {
            DescriptorType::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
    Random,
    WillNeed,
    DontNeed,
    NoReuse,
}

impl From<Advice> for system_interface::fs::Advice {
    fn from(advice: Advice) -> Self {
        use system_interface::fs::Advice as A;
        match advice {
            Advice::Normal => A::Normal,
            Advice::Sequential => A::Sequential,
            Advice::Random => A::Random,
            Advice::WillNeed => A::WillNeed,
            Advice::DontNeed => A::DontNeed,
            Advice::NoReuse => A::NoReuse,
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Datetime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Datetime {
    fn from_system_time(t: SystemTime) -> Option<Datetime> {
        let d = t.duration_since(SystemTime::UNIX_EPOCH).ok()?;
        Some(Datetime {
            seconds: d.as_secs(),
            nanoseconds: d.subsec_nanos(),
        })
    }

    fn to_system_time(self) -> FsResult<SystemTime> {
        SystemTime::UNIX_EPOCH
            .checked_add(Duration::new(self.seconds, self.nanoseconds))
            .ok_or_else(|| ErrorCode::Overflow.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewTimestamp {
    NoChange,
    Now,
    Timestamp(Datetime),
}

fn systemtimespec_from(t: NewTimestamp) -> FsResult<Option<fs_set_times::SystemTimeSpec>> {
    use fs_set_times::SystemTimeSpec;
    match t {
        NewTimestamp::NoChange => Ok(None),
        NewTimestamp::Now => Ok(Some(SystemTimeSpec::SymbolicNow)),
        NewTimestamp::Timestamp(dt) => Ok(Some(SystemTimeSpec::Absolute(dt.to_system_time()?))),
    }
}

fn cap_systemtimespec_from(t: NewTimestamp) -> FsResult<Option<cap_fs_ext::SystemTimeSpec>> {
    use cap_fs_ext::SystemTimeSpec;
    match t {
        NewTimestamp::NoChange => Ok(None),
        NewTimestamp::Now => Ok(Some(SystemTimeSpec::SymbolicNow)),
        NewTimestamp::Timestamp(dt) => Ok(Some(SystemTimeSpec::Absolute(
            cap_std::time::SystemTime::from_std(dt.to_system_time()?),
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorStat {
    pub type_: DescriptorType,
    pub link_count: u64,
    pub size: u64,
    pub data_access_timestamp: Option<Datetime>,
    pub data_modification_timestamp: Option<Datetime>,
    pub status_change_timestamp: Option<Datetime>,
}

impl From<cap_std::fs::Metadata> for DescriptorStat {
    fn from(meta: cap_std::fs::Metadata) -> Self {
        use cap_fs_ext::MetadataExt;
        let ts = |t: std::io::Result<cap_std::time::SystemTime>| {
            t.ok().and_then(|t| Datetime::from_system_time(t.into_std()))
        };
        DescriptorStat {
            type_: meta.file_type().into(),
            link_count: meta.nlink(),
            size: meta.len(),
            data_access_timestamp: ts(meta.accessed()),
            data_modification_timestamp: ts(meta.modified()),
            status_change_timestamp: ts(meta.created()),
        }
    }
}

/// A 128-bit value identifying a file's metadata (device and inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataHashValue {
    pub lower: u64,
    pub upper: u64,
}

impl From<&cap_std::fs::Metadata> for MetadataHashValue {
    fn from(meta: &cap_std::fs::Metadata) -> Self {
        use cap_fs_ext::MetadataExt;
        use std::hash::Hasher;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hasher.write_u64(meta.dev());
        hasher.write_u64(meta.ino());
        let lower = hasher.finish();
        // Only 64 bits of entropy are available; derive distinct upper bits.
        let upper = lower ^ 0x4009_21fb_5444_2d18;
        MetadataHashValue { lower, upper }
    }
}

/// One entry produced by [`Descriptor::read_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub type_: DescriptorType,
    pub name: String,
}

#[derive(Clone, Debug)]
pub enum Descriptor {
    File(File),
    Dir(Dir),
}

#[derive(Clone, Debug)]
pub struct File {
    /// The operating system File this struct is mediating access to.
    ///
    /// Wrapped in an Arc because the same file is handed to the filesystem
    /// worker for stream operations and to the blocking pool.
    file: Arc<cap_std::fs::File>,
    /// Permissions to enforce on access to the file, prior to any enforced
    /// by the operating system.
    pub perms: FilePerms,
    pub open_mode: OpenMode,
    allow_blocking_current_thread: bool,
}

impl File {
    pub(crate) fn new(
        file: cap_std::fs::File,
        perms: FilePerms,
        open_mode: OpenMode,
        allow_blocking_current_thread: bool,
    ) -> Self {
        Self {
            file: Arc::new(file),
            perms,
            open_mode,
            allow_blocking_current_thread,
        }
    }

    /// Runs `body` against the file on tokio's blocking pool, or inline when
    /// blocking the current thread is allowed.
    async fn run_blocking<F, R>(&self, body: F) -> R
    where
        F: FnOnce(&cap_std::fs::File) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.allow_blocking_current_thread {
            body(&self.file)
        } else {
            let f = Arc::clone(&self.file);
            spawn_blocking(move || body(&f)).await
        }
    }
}

#[derive(Clone, Debug)]
pub struct Dir {
    /// This directory's own handle.
    dir: Arc<cap_std::fs::Dir>,
    /// The preopen this directory was reached from; every path operation is
    /// resolved against it.
    root: Arc<cap_std::fs::Dir>,
    /// Where `dir` lives beneath `root`.
    path: GuestPath,
    /// Permissions to enforce on this directory and on any directories
    /// opened under it.
    pub perms: DirPerms,
    /// Permissions to enforce on any files opened under this directory.
    pub file_perms: FilePerms,
    pub open_mode: OpenMode,
    allow_blocking_current_thread: bool,
}

impl Dir {
    pub(crate) fn preopen(
        dir: cap_std::fs::Dir,
        perms: DirPerms,
        file_perms: FilePerms,
        allow_blocking_current_thread: bool,
    ) -> Self {
        let mut open_mode = OpenMode::empty();
        if perms.contains(DirPerms::READ) {
            open_mode |= OpenMode::READ;
        }
        if perms.contains(DirPerms::MUTATE) {
            open_mode |= OpenMode::WRITE;
        }
        let dir = Arc::new(dir);
        Dir {
            root: Arc::clone(&dir),
            dir,
            path: GuestPath::root(),
            perms,
            file_perms,
            open_mode,
            allow_blocking_current_thread,
        }
    }

    async fn run_blocking<F, R>(&self, body: F) -> R
    where
        F: FnOnce(&cap_std::fs::Dir) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.allow_blocking_current_thread {
            body(&self.dir)
        } else {
            let d = Arc::clone(&self.dir);
            spawn_blocking(move || body(&d)).await
        }
    }

    /// Resolves `path` beneath the preopen and runs `body` with the preopen
    /// handle and the resolved host path.
    async fn run_at<F, R>(&self, path: &str, body: F) -> FsResult<R>
    where
        F: FnOnce(&cap_std::fs::Dir, &Path) -> FsResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let target = self.path.join(path)?.to_host_path();
        if self.allow_blocking_current_thread {
            body(&self.root, &target)
        } else {
            let root = Arc::clone(&self.root);
            spawn_blocking(move || body(&root, &target)).await
        }
    }

    fn require(&self, perms: DirPerms) -> FsResult<()> {
        if self.perms.contains(perms) {
            Ok(())
        } else {
            Err(ErrorCode::NotPermitted.into())
        }
    }
}

enum Opened {
    File(cap_std::fs::File),
    Dir(cap_std::fs::Dir),
    NotDir,
}

fn get_from_fdflags(f: impl io_lifetimes::AsFilelike) -> std::io::Result<DescriptorFlags> {
    use system_interface::fs::{FdFlags, GetSetFdFlags};
    let flags = f.as_filelike().get_fd_flags()?;
    let mut out = DescriptorFlags::empty();
    if flags.contains(FdFlags::DSYNC) {
        out |= DescriptorFlags::REQUESTED_WRITE_SYNC;
    }
    if flags.contains(FdFlags::RSYNC) {
        out |= DescriptorFlags::DATA_INTEGRITY_SYNC;
    }
    if flags.contains(FdFlags::SYNC) {
        out |= DescriptorFlags::FILE_INTEGRITY_SYNC;
    }
    Ok(out)
}

/// Some hosts refuse to sync a file that is not open for writing. There is
/// nothing to flush in that case, so report success.
fn normalize_sync(res: std::io::Result<()>, open_mode: OpenMode) -> FsResult<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e)
            if !open_mode.contains(OpenMode::WRITE)
                && matches!(
                    ErrorCode::from(&e),
                    ErrorCode::Access | ErrorCode::NotPermitted | ErrorCode::BadDescriptor
                ) =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

impl Descriptor {
    pub fn file(&self) -> FsResult<&File> {
        match self {
            Descriptor::File(f) => Ok(f),
            Descriptor::Dir(_) => Err(ErrorCode::BadDescriptor.into()),
        }
    }

    pub fn dir(&self) -> FsResult<&Dir> {
        match self {
            Descriptor::Dir(d) => Ok(d),
            Descriptor::File(_) => Err(ErrorCode::NotDirectory.into()),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Descriptor::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Descriptor::Dir(_))
    }

    /// Closes the descriptor. Other clones keep the handle open.
    pub fn dispose(self) {}

    /// Streams the file's contents starting at `offset`.
    ///
    /// The returned future settles once the stream has ended, with the
    /// error that cut it short if any.
    pub fn read_via_stream(
        &self,
        offset: u64,
    ) -> FsResult<(StreamReader<Bytes>, FutureReader<(), FsError>)> {
        let f = self.file()?;
        if !f.perms.contains(FilePerms::READ) {
            return Err(ErrorCode::NotPermitted.into());
        }
        let (tx, rx) = stream_pair();
        let done = ROUTER.submit(FsRequest::Read {
            file: Arc::clone(&f.file),
            offset,
            stream: tx,
        });
        Ok((rx, FutureReader::from_future(done)))
    }

    /// Writes everything `data` yields at consecutive offsets starting at
    /// `offset`.
    pub fn write_via_stream(
        &self,
        data: StreamReader<Bytes>,
        offset: u64,
    ) -> FsResult<FutureReader<(), FsError>> {
        let f = self.writable_file()?;
        let done = ROUTER.submit(FsRequest::Write {
            file: Arc::clone(&f.file),
            offset,
            stream: data,
        });
        Ok(FutureReader::from_future(done))
    }

    /// Appends everything `data` yields to the end of the file.
    pub fn append_via_stream(&self, data: StreamReader<Bytes>) -> FsResult<FutureReader<(), FsError>> {
        let f = self.writable_file()?;
        let done = ROUTER.submit(FsRequest::Append {
            file: Arc::clone(&f.file),
            stream: data,
        });
        Ok(FutureReader::from_future(done))
    }

    fn writable_file(&self) -> FsResult<&File> {
        let f = self.file()?;
        if !f.perms.contains(FilePerms::WRITE) {
            return Err(ErrorCode::NotPermitted.into());
        }
        Ok(f)
    }

    /// Streams one entry per directory entry, excluding `.` and `..`.
    pub fn read_directory(
        &self,
    ) -> FsResult<(StreamReader<DirectoryEntry>, FutureReader<(), FsError>)> {
        let d = self.dir()?;
        d.require(DirPerms::READ)?;
        let (tx, rx) = stream_pair();
        let done = ROUTER.submit(FsRequest::ReadDir {
            dir: Arc::clone(&d.dir),
            stream: tx,
        });
        Ok((rx, FutureReader::from_future(done)))
    }

    pub async fn advise(&self, offset: u64, len: u64, advice: Advice) -> FsResult<()> {
        use system_interface::fs::FileIoExt;
        let f = self.file()?;
        f.run_blocking(move |f| f.advise(offset, len, advice.into()))
            .await?;
        Ok(())
    }

    pub async fn sync_data(&self) -> FsResult<()> {
        match self {
            Descriptor::File(f) => {
                let res = f.run_blocking(|f| f.sync_data()).await;
                normalize_sync(res, f.open_mode)
            }
            Descriptor::Dir(d) => {
                d.run_blocking(|d| d.open(std::path::Component::CurDir)?.sync_data())
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn sync(&self) -> FsResult<()> {
        match self {
            Descriptor::File(f) => {
                let res = f.run_blocking(|f| f.sync_all()).await;
                normalize_sync(res, f.open_mode)
            }
            Descriptor::Dir(d) => {
                d.run_blocking(|d| d.open(std::path::Component::CurDir)?.sync_all())
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn get_flags(&self) -> FsResult<DescriptorFlags> {
        match self {
            Descriptor::File(f) => {
                let mut flags = f.run_blocking(|f| get_from_fdflags(f)).await?;
                if f.open_mode.contains(OpenMode::READ) {
                    flags |= DescriptorFlags::READ;
                }
                if f.open_mode.contains(OpenMode::WRITE) {
                    flags |= DescriptorFlags::WRITE;
                }
                Ok(flags)
            }
            Descriptor::Dir(d) => {
                let mut flags = d.run_blocking(|d| get_from_fdflags(d)).await?;
                if d.perms.contains(DirPerms::READ) {
                    flags |= DescriptorFlags::READ;
                }
                if d.perms.contains(DirPerms::MUTATE) {
                    flags |= DescriptorFlags::MUTATE_DIRECTORY;
                }
                Ok(flags)
            }
        }
    }

    pub async fn get_type(&self) -> FsResult<DescriptorType> {
        match self {
            Descriptor::File(f) => {
                let meta = f.run_blocking(|f| f.metadata()).await?;
                Ok(meta.file_type().into())
            }
            Descriptor::Dir(_) => Ok(DescriptorType::Directory),
        }
    }

    pub async fn set_size(&self, size: u64) -> FsResult<()> {
        let f = self.writable_file()?;
        f.run_blocking(move |f| f.set_len(size)).await?;
        Ok(())
    }

    pub async fn set_times(&self, atim: NewTimestamp, mtim: NewTimestamp) -> FsResult<()> {
        let atim = systemtimespec_from(atim)?;
        let mtim = systemtimespec_from(mtim)?;
        match self {
            Descriptor::File(f) => {
                if !f.perms.contains(FilePerms::WRITE) {
                    return Err(ErrorCode::NotPermitted.into());
                }
                f.run_blocking(move |f| fs_set_times::SetTimes::set_times(f, atim, mtim))
                    .await?;
            }
            Descriptor::Dir(d) => {
                d.require(DirPerms::MUTATE)?;
                d.run_blocking(move |d| fs_set_times::SetTimes::set_times(d, atim, mtim))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn stat(&self) -> FsResult<DescriptorStat> {
        Ok(self.metadata().await?.into())
    }

    async fn metadata(&self) -> FsResult<cap_std::fs::Metadata> {
        let meta = match self {
            Descriptor::File(f) => f.run_blocking(|f| f.metadata()).await?,
            Descriptor::Dir(d) => d.run_blocking(|d| d.dir_metadata()).await?,
        };
        Ok(meta)
    }

    pub async fn stat_at(&self, path_flags: PathFlags, path: &str) -> FsResult<DescriptorStat> {
        let meta = self.metadata_at(path_flags, path).await?;
        Ok(meta.into())
    }

    async fn metadata_at(
        &self,
        path_flags: PathFlags,
        path: &str,
    ) -> FsResult<cap_std::fs::Metadata> {
        let d = self.dir()?;
        d.require(DirPerms::READ)?;
        let follow = path_flags.contains(PathFlags::SYMLINK_FOLLOW);
        d.run_at(path, move |root, path| {
            let meta = if follow {
                root.metadata(path)?
            } else {
                root.symlink_metadata(path)?
            };
            Ok(meta)
        })
        .await
    }

    pub async fn set_times_at(
        &self,
        path_flags: PathFlags,
        path: &str,
        atim: NewTimestamp,
        mtim: NewTimestamp,
    ) -> FsResult<()> {
        let d = self.dir()?;
        d.require(DirPerms::MUTATE)?;
        let atim = cap_systemtimespec_from(atim)?;
        let mtim = cap_systemtimespec_from(mtim)?;
        let follow = path_flags.contains(PathFlags::SYMLINK_FOLLOW);
        d.run_at(path, move |root, path| {
            use cap_fs_ext::DirExt;
            if follow {
                root.set_times(path, atim, mtim)?;
            } else {
                root.set_symlink_times(path, atim, mtim)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn create_directory_at(&self, path: &str) -> FsResult<()> {
        let d = self.dir()?;
        d.require(DirPerms::MUTATE)?;
        d.run_at(path, |root, path| Ok(root.create_dir(path)?)).await
    }

    /// Opens `path` relative to this directory.
    ///
    /// A path requested as a directory, either through
    /// [`OpenFlags::DIRECTORY`] or a trailing `/`, fails with
    /// `not-directory` when it resolves to anything else.
    pub async fn open_at(
        &self,
        path_flags: PathFlags,
        path: &str,
        oflags: OpenFlags,
        flags: DescriptorFlags,
    ) -> FsResult<Descriptor> {
        use cap_fs_ext::{FollowSymlinks, OpenOptionsFollowExt, OpenOptionsMaybeDirExt};

        let d = self.dir()?;
        d.require(DirPerms::READ)?;
        if !d.perms.contains(DirPerms::MUTATE)
            && (oflags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE)
                || flags.intersects(DescriptorFlags::WRITE | DescriptorFlags::MUTATE_DIRECTORY))
        {
            return Err(ErrorCode::NotPermitted.into());
        }
        // cap-std has no way to request these.
        if flags.intersects(
            DescriptorFlags::FILE_INTEGRITY_SYNC
                | DescriptorFlags::DATA_INTEGRITY_SYNC
                | DescriptorFlags::REQUESTED_WRITE_SYNC,
        ) {
            return Err(ErrorCode::Unsupported.into());
        }
        if oflags.contains(OpenFlags::DIRECTORY)
            && oflags.intersects(OpenFlags::CREATE | OpenFlags::EXCLUSIVE | OpenFlags::TRUNCATE)
        {
            return Err(ErrorCode::Invalid.into());
        }

        let target = d.path.join(path)?;
        let want_dir = oflags.contains(OpenFlags::DIRECTORY) || has_trailing_separator(path);

        let mut open_mode = OpenMode::empty();
        let mut opts = cap_std::fs::OpenOptions::new();
        opts.maybe_dir(true);
        if oflags.contains(OpenFlags::CREATE) {
            if oflags.contains(OpenFlags::EXCLUSIVE) {
                opts.create_new(true);
            } else {
                opts.create(true);
            }
            opts.write(true);
            open_mode |= OpenMode::WRITE;
        }
        if oflags.contains(OpenFlags::TRUNCATE) {
            opts.truncate(true).write(true);
            open_mode |= OpenMode::WRITE;
        }
        if flags.contains(DescriptorFlags::READ) {
            opts.read(true);
            open_mode |= OpenMode::READ;
        }
        if flags.contains(DescriptorFlags::WRITE) {
            opts.write(true);
            open_mode |= OpenMode::WRITE;
        } else {
            // If not opened write, open read. This way the OS lets us open
            // the file, and perms reject use of the file later.
            opts.read(true);
            open_mode |= OpenMode::READ;
        }
        if path_flags.contains(PathFlags::SYMLINK_FOLLOW) {
            opts.follow(FollowSymlinks::Yes);
        } else {
            opts.follow(FollowSymlinks::No);
        }
        if open_mode.contains(OpenMode::WRITE) && !d.file_perms.contains(FilePerms::WRITE) {
            return Err(ErrorCode::NotPermitted.into());
        }

        let host_path = target.to_host_path();
        let root = Arc::clone(&d.root);
        let opened = spawn_blocking(move || -> FsResult<Opened> {
            let file = root.open_with(&host_path, &opts)?;
            let is_dir = file.metadata()?.is_dir();
            if is_dir {
                Ok(Opened::Dir(cap_std::fs::Dir::from_std_file(file.into_std())))
            } else if want_dir {
                // The handle is dropped here.
                Ok(Opened::NotDir)
            } else {
                Ok(Opened::File(file))
            }
        })
        .await?;

        match opened {
            Opened::NotDir => Err(ErrorCode::NotDirectory.into()),
            Opened::File(file) => Ok(Descriptor::File(File::new(
                file,
                d.file_perms,
                open_mode,
                d.allow_blocking_current_thread,
            ))),
            Opened::Dir(dir) => Ok(Descriptor::Dir(Dir {
                dir: Arc::new(dir),
                root: Arc::clone(&d.root),
                path: target,
                perms: d.perms,
                file_perms: d.file_perms,
                open_mode,
                allow_blocking_current_thread: d.allow_blocking_current_thread,
            })),
        }
    }

    pub async fn readlink_at(&self, path: &str) -> FsResult<String> {
        let d = self.dir()?;
        d.require(DirPerms::READ)?;
        d.run_at(path, |root, path| {
            let link = root.read_link(path)?;
            link.into_os_string()
                .into_string()
                .map_err(|_| ErrorCode::IllegalByteSequence.into())
        })
        .await
    }

    pub async fn remove_directory_at(&self, path: &str) -> FsResult<()> {
        let d = self.dir()?;
        d.require(DirPerms::MUTATE)?;
        d.run_at(path, |root, path| Ok(root.remove_dir(path)?)).await
    }

    pub async fn rename_at(
        &self,
        old_path: &str,
        new_descriptor: &Descriptor,
        new_path: &str,
    ) -> FsResult<()> {
        let old_dir = self.dir()?;
        let new_dir = new_descriptor.dir()?;
        old_dir.require(DirPerms::MUTATE)?;
        new_dir.require(DirPerms::MUTATE)?;
        let new_root = Arc::clone(&new_dir.root);
        let new_path = new_dir.path.join(new_path)?.to_host_path();
        old_dir
            .run_at(old_path, move |root, old_path| {
                Ok(root.rename(old_path, &new_root, &new_path)?)
            })
            .await
    }

    pub async fn link_at(
        &self,
        old_path_flags: PathFlags,
        old_path: &str,
        new_descriptor: &Descriptor,
        new_path: &str,
    ) -> FsResult<()> {
        let old_dir = self.dir()?;
        let new_dir = new_descriptor.dir()?;
        old_dir.require(DirPerms::MUTATE)?;
        new_dir.require(DirPerms::MUTATE)?;
        if old_path_flags.contains(PathFlags::SYMLINK_FOLLOW) {
            return Err(ErrorCode::Invalid.into());
        }
        let new_root = Arc::clone(&new_dir.root);
        let new_path = new_dir.path.join(new_path)?.to_host_path();
        old_dir
            .run_at(old_path, move |root, old_path| {
                Ok(root.hard_link(old_path, &new_root, &new_path)?)
            })
            .await
    }

    /// Creates a symlink at `new_path` whose contents are `old_path`.
    pub async fn symlink_at(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let d = self.dir()?;
        d.require(DirPerms::MUTATE)?;
        if old_path.starts_with('/') {
            return Err(ErrorCode::NotPermitted.into());
        }
        let target = old_path.to_string();
        d.run_at(new_path, move |root, new_path| {
            #[cfg(not(windows))]
            {
                root.symlink(&target, new_path)?;
                Ok(())
            }
            #[cfg(windows)]
            {
                let _ = (root, target, new_path);
                Err(ErrorCode::Unsupported.into())
            }
        })
        .await
    }

    pub async fn unlink_file_at(&self, path: &str) -> FsResult<()> {
        let d = self.dir()?;
        d.require(DirPerms::MUTATE)?;
        let trailing_separator = has_trailing_separator(path);
        d.run_at(path, move |root, path| {
            use cap_fs_ext::DirExt;
            let is_dir = || {
                root.symlink_metadata(path)
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
            };
            if trailing_separator {
                // `file/` never names something unlinkable.
                return Err(if is_dir() {
                    ErrorCode::IsDirectory
                } else {
                    ErrorCode::NotDirectory
                }
                .into());
            }
            match root.remove_file_or_symlink(path) {
                Ok(()) => Ok(()),
                Err(e)
                    if matches!(
                        ErrorCode::from(&e),
                        ErrorCode::NotPermitted | ErrorCode::Access
                    ) && is_dir() =>
                {
                    Err(ErrorCode::IsDirectory.into())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn is_same_object(&self, other: &Descriptor) -> FsResult<bool> {
        use cap_fs_ext::MetadataExt;
        let a = self.metadata().await?;
        let b = other.metadata().await?;
        Ok(a.dev() == b.dev() && a.ino() == b.ino())
    }

    pub async fn metadata_hash(&self) -> FsResult<MetadataHashValue> {
        let meta = self.metadata().await?;
        Ok(MetadataHashValue::from(&meta))
    }

    pub async fn metadata_hash_at(
        &self,
        path_flags: PathFlags,
        path: &str,
    ) -> FsResult<MetadataHashValue> {
        let meta = self.metadata_at(path_flags, path).await?;
        Ok(MetadataHashValue::from(&meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::stream_pair;

    fn preopen(perms: DirPerms, file_perms: FilePerms) -> (tempfile::TempDir, Descriptor) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = cap_std::fs::Dir::open_ambient_dir(tmp.path(), cap_std::ambient_authority())
            .unwrap();
        let d = Descriptor::Dir(Dir::preopen(dir, perms, file_perms, false));
        (tmp, d)
    }

    #[tokio::test]
    async fn escaping_the_preopen_is_not_permitted() {
        let (_tmp, root) = preopen(DirPerms::all(), FilePerms::all());
        let err = root
            .open_at(PathFlags::empty(), "../x", OpenFlags::empty(), DescriptorFlags::READ)
            .await
            .err()
            .unwrap();
        assert_eq!(*err.code(), ErrorCode::NotPermitted);
    }

    #[tokio::test]
    async fn read_only_preopen_rejects_mutation() {
        let (tmp, root) = preopen(DirPerms::READ, FilePerms::READ);
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let err = root.create_directory_at("d").await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::NotPermitted);
        let err = root
            .open_at(PathFlags::empty(), "g", OpenFlags::CREATE, DescriptorFlags::WRITE)
            .await
            .err()
            .unwrap();
        assert_eq!(*err.code(), ErrorCode::NotPermitted);
        let f = root
            .open_at(PathFlags::empty(), "f", OpenFlags::empty(), DescriptorFlags::READ)
            .await
            .unwrap();
        let (_, rx) = stream_pair::<Bytes>();
        assert_eq!(
            *f.write_via_stream(rx, 0).err().unwrap().code(),
            ErrorCode::NotPermitted
        );
    }

    #[tokio::test]
    async fn trailing_slash_requires_a_directory() {
        let (tmp, root) = preopen(DirPerms::all(), FilePerms::all());
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let err = root
            .open_at(PathFlags::empty(), "f/", OpenFlags::empty(), DescriptorFlags::READ)
            .await
            .err()
            .unwrap();
        assert_eq!(*err.code(), ErrorCode::NotDirectory);
        let err = root.unlink_file_at("f/").await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::NotDirectory);
    }

    #[tokio::test]
    async fn unlinking_a_directory_is_reported_as_such() {
        let (_tmp, root) = preopen(DirPerms::all(), FilePerms::all());
        root.create_directory_at("d").await.unwrap();
        let err = root.unlink_file_at("d").await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::IsDirectory);
        root.remove_directory_at("d").await.unwrap();
    }

    #[tokio::test]
    async fn descriptor_kind_mismatches() {
        let (tmp, root) = preopen(DirPerms::all(), FilePerms::all());
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let f = root
            .open_at(PathFlags::empty(), "f", OpenFlags::empty(), DescriptorFlags::READ)
            .await
            .unwrap();
        assert_eq!(*root.read_via_stream(0).err().unwrap().code(), ErrorCode::BadDescriptor);
        assert_eq!(*f.create_directory_at("x").await.unwrap_err().code(), ErrorCode::NotDirectory);
        assert_eq!(f.get_type().await.unwrap(), DescriptorType::RegularFile);
        assert_eq!(root.get_type().await.unwrap(), DescriptorType::Directory);
    }
}
