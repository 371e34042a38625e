// Executor tests — block execution against scopes, op kernels, and
// backward-block emission

use stoat::prelude::*;
use stoat::Error;

fn t(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
    CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
}

fn assert_close(got: &[f64], want: &[f64]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want.iter()) {
        assert!((g - w).abs() < 1e-12, "got {:?}, want {:?}", got, want);
    }
}

#[test]
fn test_run_block_chain() {
    let mut block = Block::new();
    block.add(OpDesc::new(OpKind::Mul, &["x", "y"], &["p"]));
    block.add(OpDesc::new(OpKind::Tanh, &["p"], &["q"]));
    let mut program = Program::new();
    let id = program.add_block(block);

    let scope: Scope<CpuBackend> = Scope::new();
    scope.set_tensor("x", t(&[0.5, 0.0], 2)).unwrap();
    scope.set_tensor("y", t(&[2.0, 3.0], 2)).unwrap();

    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, id, false).unwrap();

    let q = scope.find_tensor("q").unwrap().to_f64_vec().unwrap();
    assert_close(&q, &[1.0f64.tanh(), 0.0]);
}

#[test]
fn test_parameters_resolve_through_parent() {
    // parameters live in the enclosing scope; the block runs in a child
    let mut block = Block::new();
    block.add(OpDesc::new(OpKind::Mul, &["x", "w"], &["y"]));
    let mut program = Program::new();
    let id = program.add_block(block);

    let parent: Scope<CpuBackend> = Scope::new();
    parent.set_tensor("w", t(&[10.0], 1)).unwrap();
    let step = parent.new_child();
    step.set_tensor("x", t(&[3.0], 1)).unwrap();

    let exec = Executor::new(CpuDevice);
    exec.run(&program, &step, id, false).unwrap();

    assert_eq!(
        step.find_tensor("y").unwrap().to_f64_vec().unwrap(),
        vec![30.0]
    );
    // outputs bind locally, never in the parent
    assert!(parent.find("y").is_none());
}

#[test]
fn test_create_local_scope_discards_locals() {
    let mut block = Block::new();
    block.add(OpDesc::new(OpKind::Scale { factor: 2.0 }, &["x"], &["y"]));
    let mut program = Program::new();
    let id = program.add_block(block);

    let scope: Scope<CpuBackend> = Scope::new();
    scope.set_tensor("x", t(&[1.0], 1)).unwrap();
    let exec = Executor::new(CpuDevice);

    // create_local_scope = true: the block's bindings die with the child
    exec.run(&program, &scope, id, true).unwrap();
    assert!(scope.find("y").is_none());

    // create_local_scope = false: bindings land in the given scope
    exec.run(&program, &scope, id, false).unwrap();
    assert_eq!(
        scope.find_tensor("y").unwrap().to_f64_vec().unwrap(),
        vec![2.0]
    );
}

#[test]
fn test_missing_input_fails() {
    let mut block = Block::new();
    block.add(OpDesc::new(OpKind::Tanh, &["nope"], &["y"]));
    let mut program = Program::new();
    let id = program.add_block(block);

    let scope: Scope<CpuBackend> = Scope::new();
    let exec = Executor::new(CpuDevice);
    assert!(matches!(
        exec.run(&program, &scope, id, false),
        Err(Error::VarNotFound { .. })
    ));
}

#[test]
fn test_fill_constant_and_sum() {
    let program = Program::new();
    let scope: Scope<CpuBackend> = Scope::new();
    let exec = Executor::new(CpuDevice);

    let fill = OpDesc::new(
        OpKind::FillConstant {
            shape: vec![2, 2],
            dtype: DType::F64,
            value: 1.5,
        },
        &[],
        &["c"],
    );
    exec.run_op(&program, &fill, &scope).unwrap();
    assert_eq!(
        scope.find_tensor("c").unwrap().to_f64_vec().unwrap(),
        vec![1.5; 4]
    );

    scope.set_tensor("a", t(&[1.0, 2.0, 3.0, 4.0], (2, 2))).unwrap();
    scope.set_tensor("b", t(&[10.0, 10.0, 10.0, 10.0], (2, 2))).unwrap();
    let sum = OpDesc::new(OpKind::Sum, &["a", "b", "c"], &["s"]);
    exec.run_op(&program, &sum, &scope).unwrap();
    assert_eq!(
        scope.find_tensor("s").unwrap().to_f64_vec().unwrap(),
        vec![12.5, 13.5, 14.5, 15.5]
    );
}

#[test]
fn test_identity_aliases() {
    let mut block = Block::new();
    block.add(OpDesc::new(OpKind::Identity, &["x"], &["y"]));
    let mut program = Program::new();
    let id = program.add_block(block);

    let scope: Scope<CpuBackend> = Scope::new();
    let x = t(&[1.0, 2.0], 2);
    scope.set_tensor("x", x.clone()).unwrap();
    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, id, false).unwrap();

    let y = scope.find_tensor("y").unwrap();
    assert!(y.shares_storage_with(&x));
}

// Backward blocks emitted by grad_block

#[test]
fn test_tanh_backward() {
    let mut fwd = Block::new();
    fwd.add(OpDesc::new(OpKind::Tanh, &["x"], &["y"]));
    let bwd = grad_block(&fwd, &["y"]).unwrap();

    let mut program = Program::new();
    let fwd_id = program.add_block(fwd);
    let bwd_id = program.add_block(bwd);

    let scope: Scope<CpuBackend> = Scope::new();
    scope.set_tensor("x", t(&[0.5, -0.3, 0.0], 3)).unwrap();
    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, fwd_id, false).unwrap();

    scope.set_tensor("y@GRAD", t(&[1.0, 1.0, 1.0], 3)).unwrap();
    exec.run(&program, &scope, bwd_id, false).unwrap();

    let dx = scope.find_tensor("x@GRAD").unwrap().to_f64_vec().unwrap();
    let expected: Vec<f64> = [0.5f64, -0.3, 0.0]
        .iter()
        .map(|v| 1.0 - v.tanh().powi(2))
        .collect();
    assert_close(&dx, &expected);
}

#[test]
fn test_sigmoid_and_relu_backward() {
    let mut fwd = Block::new();
    fwd.add(OpDesc::new(OpKind::Sigmoid, &["x"], &["s"]));
    fwd.add(OpDesc::new(OpKind::Relu, &["x"], &["r"]));
    let bwd = grad_block(&fwd, &["s", "r"]).unwrap();

    let mut program = Program::new();
    let fwd_id = program.add_block(fwd);
    let bwd_id = program.add_block(bwd);

    let scope: Scope<CpuBackend> = Scope::new();
    scope.set_tensor("x", t(&[1.0, -2.0], 2)).unwrap();
    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, fwd_id, false).unwrap();

    scope.set_tensor("s@GRAD", t(&[1.0, 1.0], 2)).unwrap();
    scope.set_tensor("r@GRAD", t(&[1.0, 1.0], 2)).unwrap();
    exec.run(&program, &scope, bwd_id, false).unwrap();

    // x feeds both sigmoid and relu: gradients sum
    let s = |v: f64| 1.0 / (1.0 + (-v).exp());
    let expected = [
        s(1.0) * (1.0 - s(1.0)) + 1.0, // relu passes at x = 1
        s(-2.0) * (1.0 - s(-2.0)),     // relu blocks at x = -2
    ];
    let dx = scope.find_tensor("x@GRAD").unwrap().to_f64_vec().unwrap();
    assert_close(&dx, &expected);
}

#[test]
fn test_matmul_backward() {
    let mut fwd = Block::new();
    fwd.add(OpDesc::new(OpKind::Matmul, &["a", "b"], &["c"]));
    let bwd = grad_block(&fwd, &["c"]).unwrap();

    let mut program = Program::new();
    let fwd_id = program.add_block(fwd);
    let bwd_id = program.add_block(bwd);

    let scope: Scope<CpuBackend> = Scope::new();
    scope
        .set_tensor("a", t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)))
        .unwrap();
    scope
        .set_tensor("b", t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2)))
        .unwrap();
    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, fwd_id, false).unwrap();
    assert_eq!(
        scope.find_tensor("c").unwrap().to_f64_vec().unwrap(),
        vec![4.0, 5.0, 10.0, 11.0]
    );

    scope
        .set_tensor("c@GRAD", t(&[1.0, 1.0, 1.0, 1.0], (2, 2)))
        .unwrap();
    exec.run(&program, &scope, bwd_id, false).unwrap();

    // da = dc @ bᵀ, db = aᵀ @ dc
    assert_eq!(
        scope.find_tensor("a@GRAD").unwrap().to_f64_vec().unwrap(),
        vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]
    );
    assert_eq!(
        scope.find_tensor("b@GRAD").unwrap().to_f64_vec().unwrap(),
        vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]
    );
}

#[test]
fn test_sub_and_neg_backward() {
    let mut fwd = Block::new();
    fwd.add(OpDesc::new(OpKind::Sub, &["a", "b"], &["c"]));
    let bwd = grad_block(&fwd, &["c"]).unwrap();

    let mut program = Program::new();
    let fwd_id = program.add_block(fwd);
    let bwd_id = program.add_block(bwd);

    let scope: Scope<CpuBackend> = Scope::new();
    scope.set_tensor("a", t(&[5.0, 6.0], 2)).unwrap();
    scope.set_tensor("b", t(&[1.0, 2.0], 2)).unwrap();
    let exec = Executor::new(CpuDevice);
    exec.run(&program, &scope, fwd_id, false).unwrap();
    assert_eq!(
        scope.find_tensor("c").unwrap().to_f64_vec().unwrap(),
        vec![4.0, 4.0]
    );

    scope.set_tensor("c@GRAD", t(&[1.0, 2.0], 2)).unwrap();
    exec.run(&program, &scope, bwd_id, false).unwrap();
    assert_eq!(
        scope.find_tensor("a@GRAD").unwrap().to_f64_vec().unwrap(),
        vec![1.0, 2.0]
    );
    assert_eq!(
        scope.find_tensor("b@GRAD").unwrap().to_f64_vec().unwrap(),
        vec![-1.0, -2.0]
    );
}
