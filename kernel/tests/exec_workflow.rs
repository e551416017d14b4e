//! Spawn/join workflows through the system-call dispatcher, with host
//! bodies standing in for guest code: the tiny shell scenario, argv
//! marshalling, console I/O, and error returns.

use std::sync::Arc;

use tapas_kernel::loader::ExecutableBuilder;
use tapas_kernel::process::{self, SpawnError, MAX_PROCESSES};
use tapas_kernel::syscall::numbers::*;
use tapas_kernel::usercode::{Trap, UserContext};
use tapas_kernel::{Kernel, KernelConfig};
use tapas_machine::ARG1_REG;
use tapas_machine::ARG2_REG;

fn boot() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(KernelConfig::demand()).expect("kernel boot")
}

fn install(kernel: &Arc<Kernel>, name: &str) {
    ExecutableBuilder::new()
        .code(&[0x42; 64])
        .uninit(256)
        .install(&kernel.file_system, name)
        .unwrap();
}

#[test]
fn test_tiny_shell_runs_filetest() {
    let kernel = boot();
    install(&kernel, "tiny_shell");
    install(&kernel, "filetest");

    kernel.register_program(
        "filetest",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let name_addr = ctx.stack_top() - 200;
            let buf_addr = ctx.stack_top() - 100;
            ctx.poke_cstr(name_addr, "out.txt").unwrap();

            assert_eq!(ctx.syscall(SYS_CREATE, [name_addr as i32, 0, 0, 0])?, 0);
            let fd = ctx.syscall(SYS_OPEN, [name_addr as i32, 0, 0, 0])?;
            assert!(fd >= 2);

            ctx.poke(buf_addr, b"Hello world").unwrap();
            assert_eq!(ctx.syscall(SYS_WRITE, [buf_addr as i32, 11, fd, 0])?, 11);
            assert_eq!(ctx.syscall(SYS_CLOSE, [fd, 0, 0, 0])?, 0);
            ctx.syscall(SYS_EXIT, [0, 0, 0, 0])?;
            unreachable!("exit returns through the trap");
        }),
    );

    kernel.register_program(
        "tiny_shell",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let line_addr = ctx.stack_top() - 300;
            let mut command = Vec::new();
            loop {
                assert_eq!(
                    ctx.syscall(SYS_READ, [line_addr as i32, 1, CONSOLE_INPUT, 0])?,
                    1
                );
                let b = ctx.peek(line_addr, 1).unwrap()[0];
                if b == b'\n' {
                    break;
                }
                command.push(b);
            }
            let name = String::from_utf8(command).unwrap();
            let name_addr = ctx.stack_top() - 250;
            ctx.poke_cstr(name_addr, &name).unwrap();

            let id = ctx.syscall(SYS_EXEC, [name_addr as i32, 0, 1, 0])?;
            assert!(id >= 0, "exec `{name}` failed");
            let status = ctx.syscall(SYS_JOIN, [id, 0, 0, 0])?;
            Ok(status)
        }),
    );

    kernel.machine.console.feed_input(b"filetest\n");
    let shell = process::exec(&kernel, "tiny_shell", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(shell).unwrap(), 0);

    let out = kernel.file_system.open("out.txt").unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(out.read_at(&mut buf, 0).unwrap(), 11);
    assert_eq!(&buf, b"Hello world");
}

#[test]
fn test_exec_marshals_argv() {
    let kernel = boot();
    install(&kernel, "echoargs");

    kernel.register_program(
        "echoargs",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let argc = ctx.regs.read(ARG1_REG);
            let argv = ctx.regs.read(ARG2_REG) as u32;
            assert_eq!(argc, 2);

            let arg0 = ctx.peek_word(argv).unwrap();
            assert_eq!(ctx.peek_cstr(arg0, 64).unwrap(), b"echoargs");
            let arg1 = ctx.peek_word(argv + 4).unwrap();
            assert_eq!(ctx.peek_cstr(arg1, 64).unwrap(), b"hello");
            // The array is NUL terminated.
            assert_eq!(ctx.peek_word(argv + 8).unwrap(), 0);
            Ok(argc)
        }),
    );

    let id = process::exec(
        &kernel,
        "echoargs",
        vec![b"echoargs".to_vec(), b"hello".to_vec()],
        true,
    )
    .unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 2);
}

#[test]
fn test_exec_missing_executable() {
    let kernel = boot();
    let result = process::exec(&kernel, "nope", Vec::new(), true);
    assert!(matches!(result, Err(SpawnError::Fs(_))));
}

#[test]
fn test_join_semantics_through_syscalls() {
    let kernel = boot();
    install(&kernel, "spawner");
    install(&kernel, "worker");
    // No body registered for "worker": it execs, runs to completion, and
    // exits 0.

    kernel.register_program(
        "spawner",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let name_addr = ctx.stack_top() - 64;
            ctx.poke_cstr(name_addr, "worker").unwrap();

            // Not joinable: join must fail.
            let id = ctx.syscall(SYS_EXEC, [name_addr as i32, 0, 0, 0])?;
            assert!(id >= 0);
            assert_eq!(ctx.syscall(SYS_JOIN, [id, 0, 0, 0])?, -1);

            // Joinable: join returns the worker's status.
            let id = ctx.syscall(SYS_EXEC, [name_addr as i32, 0, 1, 0])?;
            assert!(id >= 0);
            assert_eq!(ctx.syscall(SYS_JOIN, [id, 0, 0, 0])?, 0);

            // Unknown ids fail.
            assert_eq!(ctx.syscall(SYS_JOIN, [77, 0, 0, 0])?, -1);
            Ok(0)
        }),
    );

    let id = process::exec(&kernel, "spawner", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
}

#[test]
fn test_console_write_stops_at_nul() {
    let kernel = boot();
    install(&kernel, "writer");
    kernel.register_program(
        "writer",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let addr = ctx.stack_top() - 32;
            ctx.poke(addr, b"hi\0!!").unwrap();
            assert_eq!(ctx.syscall(SYS_WRITE, [addr as i32, 5, CONSOLE_OUTPUT, 0])?, 2);
            Ok(0)
        }),
    );

    let id = process::exec(&kernel, "writer", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
    assert_eq!(kernel.machine.console.take_output(), b"hi");
}

#[test]
fn test_console_read_delivers_fed_input() {
    let kernel = boot();
    install(&kernel, "reader");
    kernel.machine.console.feed_input(b"ab");

    kernel.register_program(
        "reader",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let addr = ctx.stack_top() - 16;
            assert_eq!(ctx.syscall(SYS_READ, [addr as i32, 2, CONSOLE_INPUT, 0])?, 2);
            assert_eq!(ctx.peek(addr, 2).unwrap(), b"ab");
            Ok(0)
        }),
    );

    let id = process::exec(&kernel, "reader", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
}

#[test]
fn test_file_syscalls_round_trip() {
    let kernel = boot();
    install(&kernel, "filetest2");

    kernel.register_program(
        "filetest2",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            let name = ctx.stack_top() - 200;
            let wbuf = ctx.stack_top() - 150;
            let rbuf = ctx.stack_top() - 100;
            ctx.poke_cstr(name, "t").unwrap();
            ctx.poke(wbuf, b"abcdef").unwrap();

            assert_eq!(ctx.syscall(SYS_CREATE, [name as i32, 0, 0, 0])?, 0);
            let fd = ctx.syscall(SYS_OPEN, [name as i32, 0, 0, 0])?;
            assert_eq!(ctx.syscall(SYS_WRITE, [wbuf as i32, 6, fd, 0])?, 6);
            assert_eq!(ctx.syscall(SYS_CLOSE, [fd, 0, 0, 0])?, 0);

            let fd2 = ctx.syscall(SYS_OPEN, [name as i32, 0, 0, 0])?;
            assert_eq!(ctx.syscall(SYS_READ, [rbuf as i32, 6, fd2, 0])?, 6);
            assert_eq!(ctx.peek(rbuf, 6).unwrap(), b"abcdef");

            // Reads honor the absolute offset argument.
            assert_eq!(ctx.syscall(SYS_READ, [rbuf as i32, 3, fd2, 2])?, 3);
            assert_eq!(ctx.peek(rbuf, 3).unwrap(), b"cde");

            // Removal respects the open handle, then the name is gone.
            assert_eq!(ctx.syscall(SYS_CLOSE, [fd2, 0, 0, 0])?, 0);
            assert_eq!(ctx.syscall(SYS_REMOVE, [name as i32, 0, 0, 0])?, 0);
            assert_eq!(ctx.syscall(SYS_OPEN, [name as i32, 0, 0, 0])?, -1);
            Ok(0)
        }),
    );

    let id = process::exec(&kernel, "filetest2", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
}

#[test]
fn test_invalid_syscall_arguments() {
    let kernel = boot();
    install(&kernel, "badcall");

    kernel.register_program(
        "badcall",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            // Null pointers for required arguments.
            assert_eq!(ctx.syscall(SYS_CREATE, [0, 0, 0, 0])?, -1);
            assert_eq!(ctx.syscall(SYS_OPEN, [0, 0, 0, 0])?, -1);
            assert_eq!(ctx.syscall(SYS_READ, [0, 4, 5, 0])?, -1);
            // Bad sizes and descriptors.
            let addr = (ctx.stack_top() - 16) as i32;
            assert_eq!(ctx.syscall(SYS_READ, [addr, 0, 5, 0])?, -1);
            assert_eq!(ctx.syscall(SYS_WRITE, [addr, -3, 5, 0])?, -1);
            assert_eq!(ctx.syscall(SYS_CLOSE, [0, 0, 0, 0])?, -1);
            assert_eq!(ctx.syscall(SYS_CLOSE, [9, 0, 0, 0])?, -1);
            // Unknown call id.
            assert_eq!(ctx.syscall(99, [0, 0, 0, 0])?, -1);
            Ok(0)
        }),
    );

    let id = process::exec(&kernel, "badcall", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
}

#[test]
fn test_halt_trips_the_machine() {
    let kernel = boot();
    install(&kernel, "halter");
    kernel.register_program(
        "halter",
        Arc::new(|ctx: &mut UserContext| -> Result<i32, Trap> {
            ctx.syscall(SYS_HALT, [0, 0, 0, 0])?;
            unreachable!("halt returns through the trap");
        }),
    );

    let id = process::exec(&kernel, "halter", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
    assert!(kernel.is_halted());
}

#[test]
fn test_process_table_exhaustion() {
    let kernel = boot();
    install(&kernel, "idle");
    // No body: each process exits 0 but holds its joinable slot.

    let mut ids = Vec::new();
    for _ in 0..MAX_PROCESSES {
        ids.push(process::exec(&kernel, "idle", Vec::new(), true).unwrap());
    }
    assert!(matches!(
        process::exec(&kernel, "idle", Vec::new(), true),
        Err(SpawnError::Process(_))
    ));
    for id in ids {
        assert_eq!(kernel.processes.join(id).unwrap(), 0);
    }
    // Slots recycle after join.
    let id = process::exec(&kernel, "idle", Vec::new(), true).unwrap();
    assert_eq!(kernel.processes.join(id).unwrap(), 0);
}
