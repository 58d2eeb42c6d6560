//! System-call surface.
//!
//! Numbering, user-pointer validation, and the dispatcher. Arguments arrive
//! in a0..a5 with the call number in a7; the return value goes back through
//! a0, negative values being the stable ABI error codes.

use alloc::{string::String, vec::Vec};

use crate::{
    arch::TrapFrame,
    error::{abi, KernelError, KernelResult},
    mm::{
        mspace,
        page_table::{self, PteFlags},
    },
    process, sched,
    uio::{pipe, CntlOp},
};

/// System-call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    Exit = 0,
    Exec = 1,
    Fork = 2,
    Wait = 3,
    Print = 4,
    Usleep = 5,
    FsCreate = 6,
    FsDelete = 7,
    Open = 8,
    Close = 9,
    Read = 10,
    Write = 11,
    Cntl = 12,
    Pipe = 13,
    Dup = 14,
}

impl Syscall {
    pub fn from_number(n: usize) -> Option<Self> {
        Some(match n {
            0 => Self::Exit,
            1 => Self::Exec,
            2 => Self::Fork,
            3 => Self::Wait,
            4 => Self::Print,
            5 => Self::Usleep,
            6 => Self::FsCreate,
            7 => Self::FsDelete,
            8 => Self::Open,
            9 => Self::Close,
            10 => Self::Read,
            11 => Self::Write,
            12 => Self::Cntl,
            13 => Self::Pipe,
            14 => Self::Dup,
            _ => return None,
        })
    }
}

/// Control-operation codes at the ABI.
mod cntl_code {
    pub const GET_END: usize = 0;
    pub const SET_END: usize = 1;
    pub const GET_POS: usize = 2;
    pub const SET_POS: usize = 3;
}

/// Cap on a single argv (count and per-string length are both bounded by
/// the user stack page anyway).
const MAX_ARGS: usize = 32;

/// Dispatch a syscall trap. The return value lands in the caller's a0.
pub fn dispatch(tf: &mut TrapFrame) -> isize {
    let Some(call) = Syscall::from_number(tf.syscall_number()) else {
        return abi::EINVAL;
    };
    let result = match call {
        Syscall::Exit => process::exit(tf.arg(0)),
        Syscall::Exec => match sys_exec(tf) {
            Err(e) => Err(e),
            Ok(never) => match never {},
        },
        Syscall::Fork => process::fork(tf).map(|tid| tid as isize),
        Syscall::Wait => process::wait(tf.arg(0)).map(|(tid, _code)| tid as isize),
        Syscall::Print => sys_print(tf),
        Syscall::Usleep => {
            sched::alarm::sleep_us(tf.arg(0) as u64);
            Ok(0)
        }
        Syscall::FsCreate => sys_fs_mutate(tf, true),
        Syscall::FsDelete => sys_fs_mutate(tf, false),
        Syscall::Open => sys_open(tf),
        Syscall::Close => process::handle_close(tf.arg(0)).map(|()| 0),
        Syscall::Read => sys_read(tf),
        Syscall::Write => sys_write(tf),
        Syscall::Cntl => sys_cntl(tf),
        Syscall::Pipe => sys_pipe(tf),
        Syscall::Dup => process::handle_dup(tf.arg(0)).map(|fd| fd as isize),
    };
    match result {
        Ok(value) => value,
        Err(e) => e.to_abi(),
    }
}

// --- user-memory helpers ------------------------------------------------

const USER_R: PteFlags = PteFlags::USER.union(PteFlags::READ);
const USER_W: PteFlags = PteFlags::USER
    .union(PteFlags::READ)
    .union(PteFlags::WRITE);

/// Copy `len` bytes in from a validated user pointer.
fn copy_in(uptr: usize, len: usize) -> KernelResult<Vec<u8>> {
    let root = mspace::active_space().root();
    page_table::validate_vptr(root, uptr, len, USER_R)?;
    let mut out = alloc::vec![0u8; len];
    let mut done = 0;
    while done < len {
        let at = uptr + done;
        let page_room = crate::config::PAGE_SIZE - at % crate::config::PAGE_SIZE;
        let chunk = page_room.min(len - done);
        let phys = page_table::translate(root, at).ok_or(KernelError::PermissionDenied)?;
        // SAFETY: the range was validated page by page; physical addresses
        // are kernel-readable under the identity mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(phys as *const u8, out[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(out)
}

/// Copy bytes out to a validated, writable user pointer.
fn copy_out(uptr: usize, bytes: &[u8]) -> KernelResult<()> {
    let root = mspace::active_space().root();
    page_table::validate_vptr(root, uptr, bytes.len(), USER_W)?;
    let mut done = 0;
    while done < bytes.len() {
        let at = uptr + done;
        let page_room = crate::config::PAGE_SIZE - at % crate::config::PAGE_SIZE;
        let chunk = page_room.min(bytes.len() - done);
        let phys = page_table::translate(root, at).ok_or(KernelError::PermissionDenied)?;
        // SAFETY: as in copy_in, with write access validated.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), phys as *mut u8, chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated user string in.
fn copy_in_str(uptr: usize) -> KernelResult<String> {
    let root = mspace::active_space().root();
    let len = page_table::validate_vstr(root, uptr, USER_R)?;
    let bytes = copy_in(uptr, len)?;
    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument {
        what: "string is not UTF-8",
    })
}

// --- handlers -----------------------------------------------------------

fn sys_print(tf: &TrapFrame) -> KernelResult<isize> {
    let text = copy_in_str(tf.arg(0))?;
    crate::print!("{}", text);
    Ok(text.len() as isize)
}

fn sys_exec(tf: &TrapFrame) -> KernelResult<core::convert::Infallible> {
    let path = copy_in_str(tf.arg(0))?;
    let argv_ptr = tf.arg(1);
    let mut argv = Vec::new();
    if argv_ptr != 0 {
        for i in 0..MAX_ARGS {
            let slot = copy_in(argv_ptr + i * 8, 8)?;
            let uptr = usize::from_le_bytes(slot.as_slice().try_into().unwrap());
            if uptr == 0 {
                break;
            }
            argv.push(copy_in_str(uptr)?);
        }
    }
    process::exec(&path, &argv)
}

fn sys_fs_mutate(tf: &TrapFrame, create: bool) -> KernelResult<isize> {
    let name = copy_in_str(tf.arg(0))?;
    let volume = crate::fs::root_mount().ok_or(KernelError::NoEntry)?;
    if create {
        volume.create(&name)?;
    } else {
        volume.delete(&name)?;
    }
    Ok(0)
}

fn sys_open(tf: &TrapFrame) -> KernelResult<isize> {
    let name = copy_in_str(tf.arg(0))?;
    let volume = crate::fs::root_mount().ok_or(KernelError::NoEntry)?;
    let handle = volume.open(&name)?;
    Ok(process::handle_alloc(handle)? as isize)
}

fn sys_read(tf: &TrapFrame) -> KernelResult<isize> {
    let (fd, uptr, len) = (tf.arg(0), tf.arg(1), tf.arg(2));
    if len == 0 {
        return Ok(0);
    }
    let handle = process::handle_get(fd)?;
    // Validate the destination up front, bounce through kernel memory.
    let root = mspace::active_space().root();
    page_table::validate_vptr(root, uptr, len, USER_W)?;
    let mut buf = alloc::vec![0u8; len];
    let n = handle.read(&mut buf)?;
    copy_out(uptr, &buf[..n])?;
    Ok(n as isize)
}

fn sys_write(tf: &TrapFrame) -> KernelResult<isize> {
    let (fd, uptr, len) = (tf.arg(0), tf.arg(1), tf.arg(2));
    if len == 0 {
        return Ok(0);
    }
    let handle = process::handle_get(fd)?;
    let buf = copy_in(uptr, len)?;
    let n = handle.write(&buf)?;
    Ok(n as isize)
}

/// All four control operations pass their value through the caller's
/// pointer: the get forms write it, the set forms read it.
fn sys_cntl(tf: &TrapFrame) -> KernelResult<isize> {
    let (fd, code, arg_ptr) = (tf.arg(0), tf.arg(1), tf.arg(2));
    let handle = process::handle_get(fd)?;
    match code {
        cntl_code::GET_END => {
            let value = handle.cntl(CntlOp::GetEnd)?;
            copy_out(arg_ptr, &value.to_le_bytes())?;
        }
        cntl_code::SET_END => {
            let raw = copy_in(arg_ptr, 8)?;
            let value = u64::from_le_bytes(raw.as_slice().try_into().unwrap());
            handle.cntl(CntlOp::SetEnd(value))?;
        }
        cntl_code::GET_POS => {
            let value = handle.cntl(CntlOp::GetPos)?;
            copy_out(arg_ptr, &value.to_le_bytes())?;
        }
        cntl_code::SET_POS => {
            let raw = copy_in(arg_ptr, 8)?;
            let value = u64::from_le_bytes(raw.as_slice().try_into().unwrap());
            handle.cntl(CntlOp::SetPos(value))?;
        }
        _ => {
            return Err(KernelError::InvalidArgument {
                what: "unknown control operation",
            })
        }
    }
    Ok(0)
}

/// `pipe(fds_ptr)`: write the read-end and write-end handle indices as two
/// little-endian u32 values.
fn sys_pipe(tf: &TrapFrame) -> KernelResult<isize> {
    let fds_ptr = tf.arg(0);
    let (reader, writer) = pipe::pipe();
    let fd_r = process::handle_alloc(reader)?;
    let fd_w = match process::handle_alloc(writer) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = process::handle_close(fd_r);
            return Err(e);
        }
    };
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(fd_r as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(fd_w as u32).to_le_bytes());
    if let Err(e) = copy_out(fds_ptr, &out) {
        let _ = process::handle_close(fd_r);
        let _ = process::handle_close(fd_w);
        return Err(e);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_stable() {
        assert_eq!(Syscall::from_number(0), Some(Syscall::Exit));
        assert_eq!(Syscall::from_number(14), Some(Syscall::Dup));
        assert_eq!(Syscall::from_number(15), None);
        for n in 0..15 {
            assert_eq!(Syscall::from_number(n).map(|c| c as usize), Some(n));
        }
    }

    #[test]
    fn unknown_syscall_returns_invalid_argument() {
        let mut tf = TrapFrame::zeroed();
        tf.regs[16] = 99; // a7
        assert_eq!(dispatch(&mut tf), abi::EINVAL);
    }
}
