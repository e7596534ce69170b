use std::path::Path;

/// 路径所在文件系统的可用与总字节数。
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total_bytes: u64,
    /// 非特权用户可用的空间。
    pub free_bytes: u64,
}

#[cfg(target_family = "unix")]
pub fn disk_space(path: &Path) -> std::io::Result<DiskSpace> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs 只包含整数，全零值是合法的。
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path 以 NUL 结尾，stat 是合法的输出指针。
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[allow(clippy::unnecessary_cast)]
    let frsize = stat.f_frsize as u64;
    #[allow(clippy::unnecessary_cast)]
    Ok(DiskSpace {
        total_bytes: (stat.f_blocks as u64).saturating_mul(frsize),
        free_bytes: (stat.f_bavail as u64).saturating_mul(frsize),
    })
}

#[cfg(not(target_family = "unix"))]
pub fn disk_space(_path: &Path) -> std::io::Result<DiskSpace> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free space probing is only supported on unix",
    ))
}
