use crate::HostError;
use libc::statvfs;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub fn free_space_bytes(path: &Path) -> Result<u64, HostError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HostError::Query(format!("invalid path {}", path.display())))?;
    let mut stats = MaybeUninit::<statvfs>::zeroed();
    let result = unsafe { statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
    if result != 0 {
        return Err(HostError::Io {
            context: format!("statvfs {}", path.display()),
            source: std::io::Error::last_os_error(),
        });
    }
    let stats = unsafe { stats.assume_init() };
    Ok((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}
