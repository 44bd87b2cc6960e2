// File-facing system calls. Paths come in as user strings, data moves
// through VirtAddr::User so the file layer can serve kernel callers
// with the same code.

use crate::fcntl::OpenMode;
use crate::file;
use crate::fs;
use crate::param::MAXPATH;
use crate::proc::CPUS;
use crate::stat::IType;
use crate::vm::{Addr, VirtAddr};

pub fn sys_open() -> Result<usize, ()> {
    let p = CPUS.my_proc().unwrap();
    let data = p.data_mut();

    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    let mode = OpenMode::from_usize(data.arg(1)).ok_or(())?;

    let f = file::open(path, mode).ok_or(())?;
    data.fd_alloc(f).or(Err(())) // a dropped file closes itself
}

pub fn sys_close() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let (fd, _) = data.arg_fd(0).ok_or(())?;
    data.ofile[fd].take(); // drop closes
    Ok(0)
}

pub fn sys_read() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let addr = data.arg(1);
    let len = data.arg(2);
    let (_, f) = data.arg_fd(0).ok_or(())?;
    f.read(VirtAddr::User(addr), len)
}

pub fn sys_write() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let addr = data.arg(1);
    let len = data.arg(2);
    let (_, f) = data.arg_fd(0).ok_or(())?;
    f.write(VirtAddr::User(addr), len)
}

pub fn sys_lseek() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let offset = data.arg(1) as u64;
    let whence = data.arg(2);
    let (_, f) = data.arg_fd(0).ok_or(())?;
    f.lseek(offset, whence).map(|off| off as usize)
}

pub fn sys_dup() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let (_, f) = data.arg_fd(0).ok_or(())?;
    let nf = f.dup();
    data.fd_alloc(nf).or(Err(()))
}

pub fn sys_fstat() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let addr = data.arg_addr(1);
    let (_, f) = data.arg_fd(0).ok_or(())?;
    f.stat(VirtAddr::User(addr.into_usize())).and(Ok(0))
}

// Copy the live directory entries of an open directory to user space;
// returns the number of bytes filled in.
pub fn sys_getdir() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let addr = data.arg(1);
    let len = data.arg(2);
    let (_, f) = data.arg_fd(0).ok_or(())?;
    f.dir_entries(VirtAddr::User(addr), len)
}

pub fn sys_mkdir() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    fs::path_create_inode(path, IType::Dir, 0, 0)
        .map(|_| 0) // the handle drops; the entry stays
        .ok_or(())
}

pub fn sys_chdir() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;

    let ip = fs::path_to_inode(path).ok_or(())?;
    {
        let g = ip.lock();
        if g.itype != IType::Dir {
            return Err(());
        }
    }
    // the old cwd's reference goes away with the swap.
    data.cwd.replace(ip);
    Ok(0)
}

pub fn sys_link() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let mut old = [0u8; MAXPATH];
    let mut new = [0u8; MAXPATH];
    let old_path_len = data.arg_str(0, &mut old)?.len();
    let new_path = data.arg_str(1, &mut new)?;
    fs::link(&old[..old_path_len], new_path).and(Ok(0))
}

pub fn sys_unlink() -> Result<usize, ()> {
    let data = CPUS.my_proc().unwrap().data_mut();
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    fs::unlink(path).and(Ok(0))
}
