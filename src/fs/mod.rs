pub mod hardlink;
pub mod read;
pub mod write;

pub use hardlink::LinkTracker;
pub use read::{read_link_target, read_xattrs, supports_user_xattrs, EntryType, Inode};
pub use write::{
    apply_metadata, fsync_dir, make_device, make_dir, make_fifo, make_file, make_hardlink,
    make_socket, make_symlink, write_atomic, DeviceType, Ownership,
};
