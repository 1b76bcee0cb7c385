use expect_test::expect;
use garnet_bytecode::{ArgSpec, IrepBuilder, OpCode};
use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::error::VmResult;
use crate::value::Value;
use crate::vm::Vm;

fn describe(vm: &Vm, r: VmResult<Value>) -> String {
    match r {
        Ok(v) => vm.inspect(v),
        Err(e) => vm.describe_error(&e),
    }
}

fn constant(vm: &mut Vm, name: &str) -> Value {
    vm.get_const(vm.object_class(), name)
        .unwrap_or_else(|| panic!("{} is not defined", name))
}

fn sym(vm: &mut Vm, name: &str) -> Value {
    Value::Symbol(vm.intern(name))
}

/// A block `{ |x| $acc.push(x) }` and the array it fills.
fn collector(vm: &mut Vm) -> (Value, Value) {
    let acc = vm.new_array(vec![]);
    vm.set_global("$acc", acc);
    let mut body = IrepBuilder::new(3, 5);
    body.enter(ArgSpec::required(1));
    let name = body.sym("$acc");
    body.op_ab(OpCode::GetGV, 3, name);
    body.op_ab(OpCode::Move, 4, 1);
    body.send(3, "push", 1);
    body.op_a(OpCode::Return, 3);

    let mut top = IrepBuilder::new(1, 2);
    let idx = top.child(body.build());
    top.op_ab(OpCode::Block, 1, idx);
    top.op_a(OpCode::Return, 1);
    let block = vm.run(top.build()).unwrap();
    (block, acc)
}

#[test]
fn test_string_methods() {
    let mut vm = Vm::new();
    let (ab, cd) = (vm.new_string("ab"), vm.new_string("cd"));
    let r = vm.funcall(ab, "+", &[cd]);
    assert_eq!(describe(&vm, r), r#""abcd""#);
    let r = vm.funcall(ab, "+", &[Value::Integer(1)]);
    assert_eq!(
        describe(&vm, r),
        "TypeError: no implicit conversion of Integer into String"
    );

    let accented = vm.new_string("héllo");
    assert_eq!(vm.funcall(accented, "length", &[]).unwrap(), Value::Integer(5));
    let r = vm.funcall(ab, "to_sym", &[]);
    assert_eq!(describe(&vm, r), ":ab");
    let same = vm.new_string("ab");
    assert_eq!(vm.funcall(ab, "==", &[same]).unwrap(), Value::True);

    let name = sym(&mut vm, "name");
    let r = vm.funcall(name, "to_s", &[]);
    assert_eq!(describe(&vm, r), r#""name""#);
}

#[test]
fn test_to_sym_keeps_raw_bytes() {
    let mut vm = Vm::new();
    let ff = vm.new_string(vec![b'a', 0xff]);
    let fe = vm.new_string(vec![b'a', 0xfe]);
    let a = vm.funcall(ff, "to_sym", &[]).unwrap();
    let b = vm.funcall(fe, "to_sym", &[]).unwrap();
    assert_ne!(a, b);
    assert_eq!(vm.funcall(a, "equal?", &[b]).unwrap(), Value::False);
    let again = vm.new_string(vec![b'a', 0xff]);
    assert_eq!(vm.funcall(again, "to_sym", &[]).unwrap(), a);

    let back = vm.funcall(b, "to_s", &[]).unwrap();
    assert_eq!(vm.string_bytes(back), Some(&[b'a', 0xfe][..]));

    // `INTERN` goes through the same table
    let mut top = IrepBuilder::new(1, 2);
    top.load_string(1, "x");
    top.op_a(OpCode::Intern, 1);
    top.op_a(OpCode::Return, 1);
    let x = vm.run(top.build()).unwrap();
    assert_eq!(x, Value::Symbol(vm.intern_bytes(b"x")));
}

#[test]
fn test_array_methods() {
    let mut vm = Vm::new();
    let a = vm.new_array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    vm.funcall(a, "push", &[Value::Integer(4)]).unwrap();
    assert_eq!(vm.funcall(a, "pop", &[]).unwrap(), Value::Integer(4));
    assert_eq!(vm.funcall(a, "[]", &[Value::Integer(1)]).unwrap(), Value::Integer(2));
    assert_eq!(vm.funcall(a, "[]", &[Value::Integer(-1)]).unwrap(), Value::Integer(3));
    let r = vm.funcall(a, "[]", &[Value::Integer(1), Value::Integer(5)]);
    assert_eq!(describe(&vm, r), "[2, 3]");
    assert_eq!(
        vm.funcall(a, "[]", &[Value::Integer(4), Value::Integer(1)]).unwrap(),
        Value::Nil
    );
    assert_eq!(vm.funcall(a, "first", &[]).unwrap(), Value::Integer(1));
    assert_eq!(vm.funcall(a, "size", &[]).unwrap(), Value::Integer(3));

    let x = sym(&mut vm, "x");
    vm.funcall(a, "[]=", &[Value::Integer(5), x]).unwrap();
    assert_eq!(vm.inspect(a), "[1, 2, 3, nil, nil, :x]");
    assert_eq!(vm.funcall(a, "last", &[]).unwrap(), x);

    let b = vm.new_array(vec![Value::Integer(1), Value::Integer(2)]);
    let c = vm.new_array(vec![Value::Integer(1), Value::Float(2.0)]);
    assert_eq!(vm.funcall(b, "==", &[c]).unwrap(), Value::True);
    assert_eq!(vm.funcall(b, "==", &[a]).unwrap(), Value::False);

    vm.funcall(b, "freeze", &[]).unwrap();
    let r = vm.funcall(b, "<<", &[Value::Integer(3)]);
    assert_eq!(
        describe(&vm, r),
        "FrozenError: can't modify frozen Array: [1, 2]"
    );
}

#[test]
fn test_hash_methods() {
    let mut vm = Vm::new();
    let h = vm.new_hash();
    let (a, key) = (sym(&mut vm, "a"), vm.new_string("k"));
    vm.funcall(h, "[]=", &[a, Value::Integer(1)]).unwrap();
    vm.funcall(h, "[]=", &[key, Value::Integer(2)]).unwrap();
    vm.funcall(h, "[]=", &[a, Value::Integer(3)]).unwrap();
    assert_eq!(vm.inspect(h), r#"{:a => 3, "k" => 2}"#);

    // string keys compare by content
    let other = vm.new_string("k");
    assert_eq!(vm.funcall(h, "[]", &[other]).unwrap(), Value::Integer(2));
    assert_eq!(vm.funcall(h, "delete", &[a]).unwrap(), Value::Integer(3));
    assert_eq!(vm.funcall(h, "key?", &[a]).unwrap(), Value::False);
    assert_eq!(vm.funcall(h, "length", &[]).unwrap(), Value::Integer(1));
    let r = vm.funcall(h, "values", &[]);
    assert_eq!(describe(&vm, r), "[2]");
}

#[test]
fn test_iteration_with_blocks() {
    let mut vm = Vm::new();
    let (block, acc) = collector(&mut vm);
    let range = vm.new_range(Value::Integer(1), Value::Integer(4), true);
    vm.funcall_with_block(range, "each", &[], block).unwrap();
    vm.funcall_with_block(Value::Integer(2), "times", &[], block).unwrap();
    let h = vm.new_hash();
    let k = sym(&mut vm, "k");
    vm.hash_set(h, k, Value::True).unwrap();
    vm.funcall_with_block(h, "each", &[], block).unwrap();
    assert_eq!(vm.inspect(acc), "[1, 2, 3, 0, 1, [:k, true]]");

    let r = vm.funcall(Value::Integer(3), "times", &[]);
    assert_eq!(describe(&vm, r), "LocalJumpError: no block given (yield)");
}

#[test]
fn test_numeric_methods() {
    let mut vm = Vm::new();
    assert_eq!(vm.funcall(Value::Integer(7), "to_f", &[]).unwrap(), Value::Float(7.0));
    assert_eq!(vm.funcall(Value::Float(-2.5), "to_i", &[]).unwrap(), Value::Integer(-2));
    let r = vm.funcall(Value::Float(f64::NAN), "to_i", &[]);
    assert_eq!(describe(&vm, r), "FloatDomainError: NaN");
    assert_eq!(
        vm.funcall(Value::Float(f64::NAN), "nan?", &[]).unwrap(),
        Value::True
    );
    assert_eq!(
        vm.funcall(Value::Integer(i64::MIN), "-@", &[]).unwrap(),
        Value::Float(9223372036854775808.0)
    );
    let r = vm.funcall(Value::Integer(7), "%", &[Value::Integer(-3)]);
    assert_eq!(describe(&vm, r), "-2");
    let r = vm.funcall(Value::Float(1.5), "to_s", &[]);
    assert_eq!(describe(&vm, r), r#""1.5""#);

    let s = vm.new_string("a");
    let r = vm.funcall(Value::Integer(1), "+", &[s]);
    assert_eq!(describe(&vm, r), "TypeError: String can't be coerced into Integer");
    let r = vm.funcall(Value::Integer(1), "<", &[s]);
    assert_eq!(describe(&vm, r), "ArgumentError: comparison of Integer with String failed");
    assert_eq!(
        vm.funcall(Value::Integer(1), "==", &[Value::Float(1.0)]).unwrap(),
        Value::True
    );
}

#[test]
fn test_raise_forms() {
    let mut vm = Vm::new();
    let main = vm.main_object();
    let argument_error = constant(&mut vm, "ArgumentError");
    let msg = vm.new_string("bad");

    let r = vm.funcall(main, "raise", &[argument_error, msg]);
    assert_eq!(describe(&vm, r), "ArgumentError: bad");
    let r = vm.funcall(main, "raise", &[]);
    assert_eq!(describe(&vm, r), "RuntimeError: unhandled exception");
    let r = vm.funcall(main, "raise", &[Value::Integer(5)]);
    assert_eq!(describe(&vm, r), "TypeError: exception class/object expected");

    let plain = vm.funcall(argument_error, "new", &[]).unwrap();
    let r = vm.funcall(plain, "message", &[]);
    assert_eq!(describe(&vm, r), r#""ArgumentError""#);
    let other = vm.new_string("other");
    let copy = vm.funcall(plain, "exception", &[other]).unwrap();
    assert_ne!(copy, plain);
    assert_eq!(vm.inspect(copy), "#<ArgumentError: other>");
    let r = vm.funcall(main, "raise", &[copy]);
    assert_eq!(describe(&vm, r), "ArgumentError: other");

    let standard = constant(&mut vm, "StandardError");
    assert_eq!(vm.funcall(plain, "is_a?", &[standard]).unwrap(), Value::True);
}

#[test]
fn test_anonymous_class_with_accessors() {
    let mut vm = Vm::new();
    let class = constant(&mut vm, "Class");
    let c = vm.funcall(class, "new", &[]).unwrap();
    let name = sym(&mut vm, "name");
    let r = vm.funcall(c, "attr_accessor", &[name]);
    assert_eq!(describe(&vm, r), "[:name, :name=]");

    let obj = vm.funcall(c, "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "name", &[]).unwrap(), Value::Nil);
    vm.funcall(obj, "name=", &[Value::Integer(5)]).unwrap();
    assert_eq!(vm.funcall(obj, "name", &[]).unwrap(), Value::Integer(5));
    assert_eq!(vm.get_ivar(obj, "@name"), Value::Integer(5));
    assert_eq!(vm.funcall(obj, "respond_to?", &[name]).unwrap(), Value::True);
    let nope = sym(&mut vm, "nope");
    assert_eq!(vm.funcall(obj, "respond_to?", &[nope]).unwrap(), Value::False);
    assert_eq!(vm.funcall(obj, "is_a?", &[c]).unwrap(), Value::True);

    let object = Value::Object(vm.object_class());
    assert_eq!(vm.funcall(c, "superclass", &[]).unwrap(), object);
    let kernel = constant(&mut vm, "Kernel");
    let r = vm.funcall(kernel, "new", &[]);
    assert_eq!(
        describe(&vm, r),
        "NoMethodError: undefined method 'new' for module Kernel"
    );
    let integer = constant(&mut vm, "Integer");
    let r = vm.funcall(integer, "new", &[]);
    assert_eq!(describe(&vm, r), "TypeError: allocator undefined for Integer");
}

#[test]
fn test_class_new_passes_class_to_block() {
    let mut vm = Vm::new();
    let (block, acc) = collector(&mut vm);
    let class = constant(&mut vm, "Class");
    let c = vm.funcall_with_block(class, "new", &[], block).unwrap();
    assert_eq!(vm.array_items(acc).unwrap(), &[c][..]);
    let obj = vm.funcall(c, "new", &[]).unwrap();
    assert_eq!(vm.funcall(obj, "is_a?", &[c]).unwrap(), Value::True);
}

#[test]
fn test_procs_and_define_method() {
    let mut vm = Vm::new();
    let main = vm.main_object();
    let (block, acc) = collector(&mut vm);
    let lambda = vm.funcall_with_block(main, "lambda", &[], block).unwrap();
    assert_eq!(vm.funcall(block, "lambda?", &[]).unwrap(), Value::False);
    assert_eq!(vm.funcall(lambda, "lambda?", &[]).unwrap(), Value::True);
    assert_eq!(vm.funcall(lambda, "arity", &[]).unwrap(), Value::Integer(1));

    // procs drop extra arguments, lambdas check them
    vm.funcall(block, "call", &[Value::Integer(1), Value::Integer(2)]).unwrap();
    let r = vm.funcall(lambda, "call", &[Value::Integer(1), Value::Integer(2)]);
    assert_eq!(
        describe(&vm, r),
        "ArgumentError: wrong number of arguments (given 2, expected 1)"
    );

    let class = constant(&mut vm, "Class");
    let c = vm.funcall(class, "new", &[]).unwrap();
    let collect = sym(&mut vm, "collect");
    vm.funcall_with_block(c, "define_method", &[collect], block).unwrap();
    let obj = vm.funcall(c, "new", &[]).unwrap();
    vm.funcall(obj, "collect", &[Value::Integer(9)]).unwrap();
    let r = vm.funcall(obj, "collect", &[]);
    assert_eq!(
        describe(&vm, r),
        "ArgumentError: wrong number of arguments (given 0, expected 1)"
    );
    assert_eq!(vm.inspect(acc), "[1, 9]");
}

#[test]
fn test_send_and_predicates() {
    let mut vm = Vm::new();
    let plus = sym(&mut vm, "+");
    let r = vm.funcall(Value::Integer(3), "send", &[plus, Value::Integer(4)]);
    assert_eq!(describe(&vm, r), "7");
    assert_eq!(vm.funcall(Value::Nil, "nil?", &[]).unwrap(), Value::True);
    assert_eq!(vm.funcall(Value::Integer(0), "nil?", &[]).unwrap(), Value::False);
    let numeric = constant(&mut vm, "Numeric");
    assert_eq!(vm.funcall(numeric, "===", &[Value::Float(0.5)]).unwrap(), Value::True);
    let r = vm.funcall(Value::Integer(1), "class", &[]);
    assert_eq!(describe(&vm, r), "Integer");
    let one = Value::Integer(1);
    assert_eq!(
        vm.funcall(one, "object_id", &[]).unwrap(),
        vm.funcall(one, "__id__", &[]).unwrap()
    );
    let missing = sym(&mut vm, "missing");
    let r = vm.funcall(Value::Nil, "send", &[missing]);
    assert_eq!(describe(&vm, r), "NoMethodError: undefined method 'missing' for nil");
}

#[test]
fn test_inspect_nested_values() {
    let mut vm = Vm::new();
    let a = sym(&mut vm, "a");
    let inner = vm.new_array(vec![Value::Integer(1)]);
    let h = vm.new_hash();
    vm.hash_set(h, a, inner).unwrap();
    let s = vm.new_string("s\"q");
    let range = vm.new_range(Value::Integer(1), Value::Integer(3), false);
    let v = vm.new_array(vec![
        Value::Integer(1),
        Value::Float(2.0),
        a,
        s,
        Value::Nil,
        h,
        range,
    ]);
    vm.array_push(inner, v).unwrap();
    expect![[r#"[1, 2.0, :a, "s\"q", nil, {:a => [1, [...]]}, 1..3]"#]].assert_eq(&vm.inspect(v));
}
