use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};

use garnet_bytecode::{ArgSpec, IrepBuilder, OpCode};
use pretty_assertions::assert_eq;
use test_env_log::test;

use super::*;

/// A block `{ |x| y = Fiber.yield(x + 1); y * 2 }`, created at the top level.
fn doubling_block(vm: &mut Vm) -> Value {
    let mut body = IrepBuilder::new(3, 6);
    body.enter(ArgSpec::required(1));
    let fiber = body.sym("Fiber");
    body.op_ab(OpCode::GetConst, 3, fiber);
    body.op_ab(OpCode::Move, 4, 1);
    body.op_ab(OpCode::AddI, 4, 1);
    body.send(3, "yield", 1);
    body.load_int(4, 2);
    body.op_a(OpCode::Mul, 3);
    body.op_a(OpCode::Return, 3);

    let mut top = IrepBuilder::new(1, 2);
    let idx = top.child(body.build());
    top.op_ab(OpCode::Block, 1, idx);
    top.op_a(OpCode::Return, 1);
    vm.run(top.build()).unwrap()
}

fn new_fiber(vm: &mut Vm) -> Value {
    let block = doubling_block(vm);
    let class = vm.get_const(vm.object_class(), "Fiber").unwrap();
    vm.funcall_with_block(class, "new", &[], block).unwrap()
}

#[test]
fn test_resume_and_yield_round_trip() {
    let mut vm = Vm::new();
    let fiber = new_fiber(&mut vm);
    let _pin = vm.pin(fiber);
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Created));

    let v1 = vm.resume(fiber, &[Value::Integer(1)]).unwrap();
    assert_eq!(v1, Value::Integer(2));
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Suspended));
    assert_eq!(vm.funcall(fiber, "alive?", &[]).unwrap(), Value::True);

    let v2 = vm.resume(fiber, &[Value::Integer(10)]).unwrap();
    assert_eq!(v2, Value::Integer(20));
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Dead));
    assert_eq!(vm.funcall(fiber, "alive?", &[]).unwrap(), Value::False);

    let err = vm.resume(fiber, &[]).unwrap_err();
    assert_eq!(vm.describe_error(&err), "FiberError: resuming dead fiber");
}

#[test]
fn test_resume_through_method_call() {
    let mut vm = Vm::new();
    let fiber = new_fiber(&mut vm);
    let _pin = vm.pin(fiber);
    let v = vm.funcall(fiber, "resume", &[Value::Integer(4)]).unwrap();
    assert_eq!(v, Value::Integer(5));
    let v = vm.funcall(fiber, "resume", &[Value::Integer(3)]).unwrap();
    assert_eq!(v, Value::Integer(6));
    assert_eq!(vm.funcall(fiber, "alive?", &[]).unwrap(), Value::False);
    let err = vm.funcall(fiber, "resume", &[]).unwrap_err();
    assert_eq!(vm.describe_error(&err), "FiberError: resuming dead fiber");
}

#[test]
fn test_yield_outside_fiber() {
    let mut vm = Vm::new();
    let class = vm.get_const(vm.object_class(), "Fiber").unwrap();
    let err = vm.funcall(class, "yield", &[]).unwrap_err();
    assert_eq!(vm.describe_error(&err), "FiberError: can't yield from root fiber");
}

#[test]
fn test_fiber_new_needs_block() {
    let mut vm = Vm::new();
    let class = vm.get_const(vm.object_class(), "Fiber").unwrap();
    let err = vm.funcall(class, "new", &[]).unwrap_err();
    assert_eq!(
        vm.describe_error(&err),
        "ArgumentError: tried to create Proc object without a block"
    );
}

#[test]
fn test_raising_body_ends_with_error() {
    let mut vm = Vm::new();
    let mut body = IrepBuilder::new(3, 5);
    body.enter(ArgSpec::new(0, 0, true, 0, 0, false, false));
    body.load_string(3, "inside");
    body.ssend(2, "raise", 1);
    body.op_a(OpCode::Return, 2);
    let mut top = IrepBuilder::new(1, 2);
    let idx = top.child(body.build());
    top.op_ab(OpCode::Block, 1, idx);
    top.op_a(OpCode::Return, 1);
    let block = vm.run(top.build()).unwrap();
    let fiber = vm.new_fiber(block).unwrap();

    let err = vm.resume(fiber, &[]).unwrap_err();
    assert_eq!(vm.describe_error(&err), "RuntimeError: inside");
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Error));
    assert!(!vm.fiber_state(fiber).unwrap().is_alive());
}

#[test]
fn test_resuming_the_running_fiber() {
    let mut vm = Vm::new();
    // Fiber.new { $fiber.resume }
    let mut body = IrepBuilder::new(3, 5);
    body.enter(ArgSpec::new(0, 0, true, 0, 0, false, false));
    let name = body.sym("$fiber");
    body.op_ab(OpCode::GetGV, 3, name);
    body.send(3, "resume", 0);
    body.op_a(OpCode::Return, 3);
    let mut top = IrepBuilder::new(1, 2);
    let idx = top.child(body.build());
    top.op_ab(OpCode::Block, 1, idx);
    top.op_a(OpCode::Return, 1);
    let block = vm.run(top.build()).unwrap();
    let fiber = vm.new_fiber(block).unwrap();
    vm.set_global("$fiber", fiber);

    let err = vm.resume(fiber, &[]).unwrap_err();
    assert_eq!(vm.describe_error(&err), "FiberError: double resume");
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Error));
    assert_eq!(vm.native_depth, 0);
}

#[derive(Default)]
struct CountingWaker(AtomicUsize);

impl Wake for CountingWaker {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_waiters_complete_with_the_fiber() {
    let mut vm = Vm::new();
    let fiber = new_fiber(&mut vm);
    let _pin = vm.pin(fiber);
    let counter = Arc::new(CountingWaker::default());
    let waker = Waker::from(counter.clone());
    let mut cx = TaskContext::from_waker(&waker);

    let mut resumed = vm.resume_waiter(fiber).unwrap();
    let mut ended = vm.termination_waiter(fiber).unwrap();
    assert_eq!(Pin::new(&mut resumed).poll(&mut cx), Poll::Pending);
    // polling again with the same waker does not register it twice
    assert_eq!(Pin::new(&mut resumed).poll(&mut cx), Poll::Pending);
    assert_eq!(Pin::new(&mut ended).poll(&mut cx), Poll::Pending);

    vm.resume(fiber, &[Value::Integer(1)]).unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert_eq!(Pin::new(&mut resumed).poll(&mut cx), Poll::Ready(()));
    assert_eq!(Pin::new(&mut ended).poll(&mut cx), Poll::Pending);

    vm.resume(fiber, &[Value::Integer(2)]).unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    assert_eq!(Pin::new(&mut ended).poll(&mut cx), Poll::Ready(FiberState::Dead));

    // a waiter created after the end completes at once
    let mut late = vm.resume_waiter(fiber).unwrap();
    assert_eq!(Pin::new(&mut late).poll(&mut cx), Poll::Ready(()));
}

#[test]
fn test_state_display() {
    assert_eq!(FiberState::Created.to_string(), "created");
    assert_eq!(FiberState::Error.to_string(), "terminated with error");
    assert!(FiberState::Suspended.is_alive());
    assert!(!FiberState::Dead.is_alive());
}
