//! Processes.
//!
//! A process is a primary thread, a memory-space tag, and a fixed-size
//! handle table. `fork` clones the active space and duplicates every live
//! handle; `exec` replaces the active space with a freshly loaded image and
//! a user stack; `exit` closes the handles, discards the space, and ends
//! the thread.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{string::String, vec::Vec};

use spin::Mutex;

use crate::{
    arch::{self, TrapFrame},
    config::{N_PROC, N_UIO, PAGE_SIZE, UMEM_END},
    error::{KernelError, KernelResult},
    mm::{mspace, mspace::SpaceTag, Mapper, PteFlags, PAGE_POOL},
    sched::{self, Condition, Tid},
    sync::OnceLock,
    uio::UioHandle,
};

pub struct Process {
    pub main_tid: Tid,
    pub space: SpaceTag,
    pub handles: [Option<UioHandle>; N_UIO],
}

static TABLE: Mutex<[Option<Process>; N_PROC]> = Mutex::new([const { None }; N_PROC]);

/// Image loader seam: maps an executable into the active space and returns
/// its entry point. Registered by the boot code; exec fails without one.
pub type LoaderFn = fn(name: &str) -> KernelResult<usize>;

static LOADER: OnceLock<LoaderFn> = OnceLock::new();

pub fn register_loader(loader: LoaderFn) {
    let _ = LOADER.set(loader);
}

/// Install process 0 for the boot thread.
pub fn init() {
    let mut table = TABLE.lock();
    if table[0].is_none() {
        table[0] = Some(Process {
            main_tid: sched::MAIN_TID,
            space: mspace::active_space(),
            handles: [const { None }; N_UIO],
        });
        log::info!(target: "process", "process manager ready, {} slots", N_PROC);
    }
}

fn with_current<R>(f: impl FnOnce(&mut Process) -> KernelResult<R>) -> KernelResult<R> {
    let pid = sched::current_pid();
    let mut table = TABLE.lock();
    let proc = table[pid]
        .as_mut()
        .unwrap_or_else(|| panic!("thread {} has no process record", sched::current_tid()));
    f(proc)
}

// --- handle table ------------------------------------------------------

/// Put a handle into the first free slot of the current process's table.
pub fn handle_alloc(handle: UioHandle) -> KernelResult<usize> {
    with_current(|proc| {
        let fd = proc
            .handles
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TooManyFiles)?;
        proc.handles[fd] = Some(handle);
        Ok(fd)
    })
}

pub fn handle_get(fd: usize) -> KernelResult<UioHandle> {
    with_current(|proc| {
        proc.handles
            .get(fd)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(KernelError::BadHandle)
    })
}

/// Drop the slot's reference; the object closes when the last one goes.
pub fn handle_close(fd: usize) -> KernelResult<()> {
    let handle = with_current(|proc| {
        proc.handles
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadHandle)
    })?;
    drop(handle);
    Ok(())
}

/// Duplicate a handle into a fresh slot, bumping its reference count.
pub fn handle_dup(fd: usize) -> KernelResult<usize> {
    with_current(|proc| {
        let handle = proc
            .handles
            .get(fd)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(KernelError::BadHandle)?;
        let new_fd = proc
            .handles
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TooManyFiles)?;
        proc.handles[new_fd] = Some(handle);
        Ok(new_fd)
    })
}

fn dup_handle_table(handles: &[Option<UioHandle>; N_UIO]) -> [Option<UioHandle>; N_UIO] {
    let mut copy = [const { None }; N_UIO];
    for (slot, src) in copy.iter_mut().zip(handles.iter()) {
        *slot = src.clone();
    }
    copy
}

// --- lifecycle ---------------------------------------------------------

/// Startup block a fork hands to its child thread. It lives on the parent's
/// stack: the parent blocks on `done` until the child has copied it out.
struct ForkStartup {
    tf: TrapFrame,
    space: SpaceTag,
    copied: AtomicBool,
    done: Condition,
}

/// Fork the current process. The parent receives the child's thread id;
/// the child enters user mode with `a0 = 0` and the parent's registers
/// otherwise intact (the trap path has already advanced the pc past the
/// ecall).
pub fn fork(tf: &TrapFrame) -> KernelResult<Tid> {
    let child_pid = {
        let table = TABLE.lock();
        table
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TooManyProcesses)?
    };

    let space = mspace::clone_active();
    let handles = with_current(|proc| Ok(dup_handle_table(&proc.handles)))?;

    let startup = ForkStartup {
        tf: *tf,
        space,
        copied: AtomicBool::new(false),
        done: Condition::new("fork-done"),
    };
    let child_tid = match sched::spawn(
        "forked",
        fork_child_entry,
        [&startup as *const ForkStartup as usize, 0, 0, 0, 0, 0, 0, 0],
    ) {
        Ok(tid) => tid,
        Err(e) => {
            mspace_discard_unowned(space);
            return Err(e);
        }
    };
    sched::set_thread_pid(child_tid, child_pid);
    TABLE.lock()[child_pid] = Some(Process {
        main_tid: child_tid,
        space,
        handles,
    });

    // The startup block is on this stack: wait until the child copied it.
    startup
        .done
        .wait_if(|| !startup.copied.load(Ordering::Acquire));
    Ok(child_tid)
}

/// Tear down a cloned space that never got a process record.
fn mspace_discard_unowned(space: SpaceTag) {
    let mut pool = PAGE_POOL.lock();
    Mapper::new(space.root(), &mut pool).discard_tree();
}

fn fork_child_entry(args: [usize; 8]) {
    let startup = args[0] as *const ForkStartup;
    // SAFETY: the parent keeps the startup block alive until `copied` is
    // signaled below.
    let (mut tf, space) = unsafe { ((*startup).tf, (*startup).space) };
    // SAFETY: as above.
    unsafe {
        (*startup).copied.store(true, Ordering::Release);
        (*startup).done.broadcast();
    }

    tf.set_a0(0);
    mspace::make_active(space);
    if let Some(top) = sched::kernel_stack_top(sched::current_tid()) {
        arch::set_kernel_trap_sp(top);
    }
    arch::enter_user(&tf);
}

/// Replace the current image. On success this never returns; the process
/// restarts at the new entry with `a0 = argc` and `a1 = argv`.
pub fn exec(path: &str, argv: &[String]) -> KernelResult<core::convert::Infallible> {
    let loader = LOADER.get().ok_or(KernelError::NotSupported {
        operation: "exec without a registered loader",
    })?;

    mspace::reset_active();
    let entry = loader(path)?;

    // The top user page is the stack: argv pointer array, then the argument
    // strings, then a 16-byte alignment pad below.
    let stack_page = {
        let mut pool = PAGE_POOL.lock();
        let mut mapper = Mapper::new(mspace::active_space().root(), &mut pool);
        mapper.alloc_and_map_range(
            UMEM_END - PAGE_SIZE,
            PAGE_SIZE,
            PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
        )
    };
    let frame = stack_page.as_ptr() as usize;

    // Lay the strings out from the top of the page downwards, recording
    // their user addresses.
    let mut top = PAGE_SIZE;
    let mut user_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        top -= bytes.len() + 1;
        // SAFETY: offsets stay inside the freshly mapped stack frame.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), (frame + top) as *mut u8, bytes.len());
            *((frame + top + bytes.len()) as *mut u8) = 0;
        }
        user_ptrs.push(UMEM_END - PAGE_SIZE + top);
    }
    user_ptrs.reverse();

    // Pointer array below the strings, then pad to 16 bytes.
    top -= user_ptrs.len() * core::mem::size_of::<usize>();
    top &= !0xF;
    let argv_base = UMEM_END - PAGE_SIZE + top;
    for (i, uptr) in user_ptrs.iter().enumerate() {
        // SAFETY: as above.
        unsafe { *((frame + top + i * 8) as *mut usize) = *uptr };
    }

    let mut tf = TrapFrame::zeroed();
    tf.pc = entry;
    tf.set_sp(argv_base);
    tf.set_a0(argv.len());
    tf.set_a1(argv_base);
    if let Some(top) = sched::kernel_stack_top(sched::current_tid()) {
        arch::set_kernel_trap_sp(top);
    }
    log::debug!(target: "process", "exec '{}', entry {:#x}", path, entry);
    arch::enter_user(&tf);
}

/// Terminate the current process: close every handle, discard the memory
/// space, free the record, and end the thread.
pub fn exit(code: usize) -> ! {
    let pid = sched::current_pid();
    let record = TABLE.lock()[pid].take();
    drop(record);
    mspace::discard_active();
    sched::exit(code);
}

/// Fatal-fault path (page fault or illegal instruction in user mode).
pub fn fault_exit() -> ! {
    log::error!(
        target: "process",
        "process {} killed by fault",
        sched::current_pid()
    );
    exit(0xFF);
}

/// Wait for a child thread (0 = any), reaping it. Returns the child tid.
pub fn wait(child: Tid) -> KernelResult<(Tid, usize)> {
    sched::join(child)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::uio::pipe;

    // One test function: the process table is global state (and the tests
    // run as thread 0 / process 0).
    #[test]
    fn handle_table_lifecycle_and_refcounts() {
        init();

        let (reader, writer) = pipe::pipe();
        let base = Arc::strong_count(&reader);

        let fd_r = handle_alloc(reader.clone()).unwrap();
        assert_eq!(Arc::strong_count(&reader), base + 1);

        let dup_fd = handle_dup(fd_r).unwrap();
        assert_ne!(dup_fd, fd_r);
        assert_eq!(Arc::strong_count(&reader), base + 2);

        // Both slots resolve to the same object.
        let via_get = handle_get(fd_r).unwrap();
        assert_eq!(Arc::strong_count(&reader), base + 3);
        drop(via_get);

        handle_close(fd_r).unwrap();
        assert_eq!(Arc::strong_count(&reader), base + 1);
        assert_eq!(handle_close(fd_r), Err(KernelError::BadHandle));
        handle_close(dup_fd).unwrap();
        assert_eq!(Arc::strong_count(&reader), base);

        // Table inheritance across fork duplicates only live slots.
        let fd_w = handle_alloc(writer.clone()).unwrap();
        let copy = with_current(|proc| Ok(dup_handle_table(&proc.handles))).unwrap();
        assert!(copy[fd_w].is_some());
        assert_eq!(Arc::strong_count(&writer), 3);
        assert_eq!(copy.iter().filter(|slot| slot.is_some()).count(), 1);
        drop(copy);
        handle_close(fd_w).unwrap();

        // Exhaust the table.
        let mut fds = Vec::new();
        loop {
            match handle_alloc(writer.clone()) {
                Ok(fd) => fds.push(fd),
                Err(KernelError::TooManyFiles) => break,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(fds.len(), N_UIO);
        for fd in fds {
            handle_close(fd).unwrap();
        }

        assert!(matches!(handle_get(9999), Err(KernelError::BadHandle)));
    }
}
