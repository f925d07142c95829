pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Size of one disk sector. All IDE disks use this sector size.
pub const SECTOR_SIZE: usize = 512;
