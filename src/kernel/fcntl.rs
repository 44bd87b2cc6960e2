use bitflags::bitflags;

bitflags! {
    // open() mode bits, shared with user space.
    pub struct OpenMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const CREATE = 0x4;
    }
}

impl OpenMode {
    pub fn from_usize(bits: usize) -> Option<Self> {
        OpenMode::from_bits(bits as u32)
    }

    pub fn is_read(&self) -> bool {
        self.contains(OpenMode::READ)
    }

    pub fn is_write(&self) -> bool {
        self.contains(OpenMode::WRITE)
    }

    pub fn is_create(&self) -> bool {
        self.contains(OpenMode::CREATE)
    }
}

// lseek() whence values.
pub const SEEK_SET: usize = 0;
pub const SEEK_ADD: usize = 1;
pub const SEEK_SUB: usize = 2;

// The offset arithmetic for lseek, separated out so the edge cases
// have a home of their own: backward seeks saturate at zero rather
// than wrapping, and an unknown whence is an error.
pub fn seek_offset(cur: u64, offset: u64, whence: usize) -> Result<u64, ()> {
    match whence {
        SEEK_SET => Ok(offset),
        SEEK_ADD => cur.checked_add(offset).ok_or(()),
        SEEK_SUB => Ok(cur.saturating_sub(offset)),
        _ => Err(()),
    }
}

#[cfg(test)]
mod seek_tests {
    use super::*;

    #[test]
    fn whence_arithmetic() {
        assert_eq!(seek_offset(100, 5, SEEK_SET), Ok(5));
        assert_eq!(seek_offset(100, 5, SEEK_ADD), Ok(105));
        assert_eq!(seek_offset(100, 5, SEEK_SUB), Ok(95));
        assert_eq!(seek_offset(3, 10, SEEK_SUB), Ok(0));
        assert_eq!(seek_offset(0, 0, 9), Err(()));
        assert_eq!(seek_offset(u64::MAX, 1, SEEK_ADD), Err(()));
    }

    #[test]
    fn mode_bits() {
        let m = OpenMode::from_usize(0x3).unwrap();
        assert!(m.is_read() && m.is_write() && !m.is_create());
        assert!(OpenMode::from_usize(0x100).is_none());
    }
}
