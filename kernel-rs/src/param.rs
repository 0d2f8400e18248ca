/// Size of a block device sector (bytes).
pub const SECTOR_SIZE: usize = 512;

/// Size of the sector buffer cache.
pub const NBUF: usize = 64;

/// Direct sector pointers per on-disk inode.
pub const NDIRECT: usize = 123;

/// Sector pointers per indirect block.
pub const NINDIRECT: usize = SECTOR_SIZE / 4;

/// Largest logical sector index an inode can address.
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file size (bytes).
pub const MAXFILE: usize = MAXSECTORS * SECTOR_SIZE;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Bytes of a directory entry name.
pub const DIRNAME_SIZE: usize = 15;

/// Lowest file descriptor handed to user programs (0/1/2 are reserved).
pub const FD_BASE: i32 = 3;

/// Open files per process.
pub const NOFILE: usize = 128;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Maximum length of an exec command line.
pub const MAXCMDLINE: usize = 128;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum number of swap slots tracked by the swap bitmap.
pub const NSWAP: usize = 1024;
