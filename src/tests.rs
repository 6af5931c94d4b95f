use once_cell::sync::Lazy;

use crate::{
    self as larus, AggregateKind, BasicBlockBuilder, Callee, CmpKind, CostKind, Module, Options,
    Type,
};

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

fn init() {
    Lazy::force(&LOGGER);
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= 1e-9,
        "expected {} but got {}",
        expected,
        actual
    );
}

fn run(module: &mut Module, options: &Options) -> larus::CallFrequencies {
    let freqs = larus::CallFrequencies::new(module, options);
    check_invariants(module, &freqs);
    freqs
}

/// The invariants every analyzed module must satisfy: probabilities sum to
/// one (or to zero after a no-return call), edge frequencies factor into
/// probability times block frequency, global frequencies scale by the
/// invocation frequency, and everything is finite and non-negative.
fn check_invariants(module: &Module, freqs: &larus::CallFrequencies) {
    for func in module.func_ids() {
        let proc = module.procedure(func);
        if proc.is_declaration() {
            continue;
        }
        let bf = freqs.block_frequencies(func).unwrap();
        let bp = bf.branch_probabilities();
        for block in proc.blocks() {
            let succs = proc.block(block).successor_list().to_vec();
            if !succs.is_empty() {
                let sum: f64 = succs
                    .iter()
                    .map(|&succ| bp.edge_probability(block, succ))
                    .sum();
                assert!(
                    (sum - 1.0).abs() <= 1e-9 || sum.abs() <= 1e-9,
                    "edge probabilities of {:?} in {} sum to {}",
                    block,
                    proc.name(),
                    sum
                );
            }

            let freq = bf.block_frequency(block);
            assert!(freq.is_finite() && freq >= 0.0);
            for &succ in succs.iter() {
                let efreq = bf.edge_frequency(block, succ);
                assert!(efreq.is_finite() && efreq >= 0.0);
                assert_close(efreq, bp.edge_probability(block, succ) * freq);
            }

            assert_close(
                freqs.global_block_frequency(func, block),
                freq * freqs.invocation_frequency(func),
            );
        }
    }

    for (caller, callee) in freqs.call_edges() {
        let gfreq = freqs.global_call_frequency(caller, callee);
        assert!(gfreq.is_finite() && gfreq >= 0.0);
        assert_close(
            gfreq,
            freqs.local_call_frequency(caller, callee) * freqs.invocation_frequency(caller),
        );
    }

    let root = freqs.root();
    assert_close(freqs.invocation_frequency(root), 1.0);
    assert_close(
        freqs
            .block_frequencies(root)
            .unwrap()
            .block_frequency(module.procedure(root).entry()),
        1.0,
    );
}

#[test]
fn linear_two_blocks() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    BasicBlockBuilder::new(proc, b0).jump(b1);
    BasicBlockBuilder::new(proc, b1).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    assert_close(bf.block_frequency(b0), 1.0);
    assert_close(bf.block_frequency(b1), 1.0);
    assert_close(
        bf.branch_probabilities().edge_probability(b0, b1),
        1.0,
    );
    assert_close(bf.edge_frequency(b0, b1), 1.0);
}

#[test]
fn if_then_else_without_matching_heuristics() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let b3 = proc.add_block();

    let mut builder = BasicBlockBuilder::new(proc, b0);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b1, b2);
    BasicBlockBuilder::new(proc, b1).jump(b3);
    BasicBlockBuilder::new(proc, b2).jump(b3);
    BasicBlockBuilder::new(proc, b3).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    let bp = bf.branch_probabilities();
    assert_close(bp.edge_probability(b0, b1), 0.5);
    assert_close(bp.edge_probability(b0, b2), 0.5);
    assert_close(bf.block_frequency(b1), 0.5);
    assert_close(bf.block_frequency(b2), 0.5);
    assert_close(bf.block_frequency(b3), 1.0);
}

/// One loop with an empty body: the loop branch heuristic alone decides the
/// header's probabilities, and the cyclic correction turns 0.88 into a
/// frequency of 1/0.12.
#[test]
fn simple_loop() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let b3 = proc.add_block();

    let mut builder = BasicBlockBuilder::new(proc, b0);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b2, b3);
    BasicBlockBuilder::new(proc, b2).jump(b1);
    BasicBlockBuilder::new(proc, b3).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    let bp = bf.branch_probabilities();
    assert_close(bp.edge_probability(b1, b2), 0.88);
    assert_close(bp.edge_probability(b1, b3), 0.12);
    assert_close(bf.block_frequency(b1), 1.0 / 0.12);
    assert_close(bf.block_frequency(b2), 0.88 / 0.12);
    assert_close(bf.block_frequency(b3), 1.0);
}

#[test]
fn two_calls_to_the_same_helper() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let helper = module.add_procedure("helper");

    let proc = module.procedure_mut(helper);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    builder.call(Type::Void, Callee::Direct(helper), &[]);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    builder.call(Type::Void, Callee::Direct(helper), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());
    assert_close(freqs.local_call_frequency(main, helper), 2.0);
    assert_close(freqs.global_call_frequency(main, helper), 2.0);
    assert_close(freqs.invocation_frequency(main), 1.0);
    assert_close(freqs.invocation_frequency(helper), 2.0);
}

/// Direct recursion: the recursive edge becomes a call-graph back edge and
/// the invocation frequency is the geometric sum 1/(1 - lfreq).
#[test]
fn direct_recursion() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let f = module.add_procedure("f");

    let proc = module.procedure_mut(f);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b1, b2);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    builder.call(Type::Void, Callee::Direct(f), &[]);
    builder.jump(b2);
    BasicBlockBuilder::new(proc, b2).ret(None);

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    builder.call(Type::Void, Callee::Direct(f), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());

    // The call heuristic steers away from the recursive arm: 0.22 of an
    // invocation recurses.
    let lfreq = freqs.local_call_frequency(f, f);
    assert_close(lfreq, 0.22);
    assert_close(freqs.invocation_frequency(f), 1.0 / (1.0 - lfreq));
    assert_close(
        freqs.global_call_frequency(f, f),
        lfreq * freqs.invocation_frequency(f),
    );
}

#[test]
fn indirect_call_through_pointer_set_once() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");

    let proc = module.procedure_mut(foo);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    let cell = builder.alloca();
    let addr = builder.func_addr(foo);
    builder.store(addr, cell);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    let loaded = builder.load(Type::Ptr, cell);
    builder.call(Type::Void, Callee::Indirect(loaded), &[]);
    builder.ret(None);

    // Without the tracer the site contributes nothing.
    let freqs = run(&mut module, &Options::default());
    assert_close(freqs.local_call_frequency(main, foo), 0.0);
    assert_close(freqs.invocation_frequency(foo), 0.0);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 1.0);
    assert_close(freqs.global_call_frequency(main, foo), 1.0);
    assert_close(freqs.invocation_frequency(foo), 1.0);
}

/// The pointer is overwritten on one arm of a diamond: each store keeps the
/// share of paths on which its value survives to the call.
#[test]
fn indirect_call_with_overwriting_store() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let bar = module.add_procedure("bar");
    for func in [foo, bar] {
        let proc = module.procedure_mut(func);
        let entry = proc.add_block();
        BasicBlockBuilder::new(proc, entry).ret(None);
    }

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let b3 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    let cell = builder.alloca();
    let foo_addr = builder.func_addr(foo);
    builder.store(foo_addr, cell);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b1, b2);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    let bar_addr = builder.func_addr(bar);
    builder.store(bar_addr, cell);
    builder.jump(b3);
    BasicBlockBuilder::new(proc, b2).jump(b3);
    let mut builder = BasicBlockBuilder::new(proc, b3);
    let loaded = builder.load(Type::Ptr, cell);
    builder.call(Type::Void, Callee::Indirect(loaded), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);

    // The store heuristic sends 0.55 of the paths through the arm without
    // the second store, so the first store survives with 0.55 and the
    // overwrite accounts for the remaining 0.45.
    assert_close(freqs.local_call_frequency(main, foo), 0.55);
    assert_close(freqs.local_call_frequency(main, bar), 0.45);
}

/// A call site inside a loop: the store's weight is its block frequency
/// scaled by the probability of reaching the call, not by the iteration
/// count.
#[test]
fn indirect_call_inside_loop() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let helper = module.add_procedure("helper");
    for func in [foo, helper] {
        let proc = module.procedure_mut(func);
        let entry = proc.add_block();
        BasicBlockBuilder::new(proc, entry).ret(None);
    }

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let b3 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    let cell = builder.alloca();
    let addr = builder.func_addr(foo);
    builder.store(addr, cell);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b2, b3);
    let mut builder = BasicBlockBuilder::new(proc, b2);
    let loaded = builder.load(Type::Ptr, cell);
    builder.call(Type::Void, Callee::Indirect(loaded), &[]);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b3);
    builder.call(Type::Void, Callee::Direct(helper), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 0.88);
}

#[test]
fn indirect_call_through_returned_pointer() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let get_fp = module.add_procedure("get_fp");

    let proc = module.procedure_mut(foo);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(get_fp);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let addr = builder.func_addr(foo);
    builder.ret(Some(addr));

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let fp = builder.call(Type::Ptr, Callee::Direct(get_fp), &[]);
    builder.call(Type::Void, Callee::Indirect(fp), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 1.0);
    assert_close(freqs.invocation_frequency(foo), 1.0);
}

/// The pointer cell is passed by address to a callee that fills it in: the
/// tracer follows the parameter through its spill slot to the store.
#[test]
fn indirect_call_through_out_parameter() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let set_fp = module.add_procedure("set_fp");

    let proc = module.procedure_mut(foo);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(set_fp);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let param = builder.param(0, Type::Ptr);
    let slot = builder.alloca();
    builder.store(param, slot);
    let reloaded = builder.load(Type::Ptr, slot);
    let addr = builder.func_addr(foo);
    builder.store(addr, reloaded);
    builder.ret(None);

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let cell = builder.alloca();
    builder.call(Type::Void, Callee::Direct(set_fp), &[cell]);
    let loaded = builder.load(Type::Ptr, cell);
    builder.call(Type::Void, Callee::Indirect(loaded), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 1.0);
}

#[test]
fn indirect_call_through_struct_field() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");

    let proc = module.procedure_mut(foo);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let object = builder.alloca();
    let field = builder.gep(AggregateKind::Struct, object, &[0, 1]);
    let addr = builder.func_addr(foo);
    builder.store(addr, field);
    let field_again = builder.gep(AggregateKind::Struct, object, &[0, 1]);
    let loaded = builder.load(Type::Ptr, field_again);
    builder.call(Type::Void, Callee::Indirect(loaded), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 1.0);
}

#[test]
fn indirect_call_through_phi() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let bar = module.add_procedure("bar");
    for func in [foo, bar] {
        let proc = module.procedure_mut(func);
        let entry = proc.add_block();
        BasicBlockBuilder::new(proc, entry).ret(None);
    }

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let b2 = proc.add_block();
    let b3 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    builder.branch(cond, b1, b2);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    let foo_addr = builder.func_addr(foo);
    builder.jump(b3);
    let mut builder = BasicBlockBuilder::new(proc, b2);
    let bar_addr = builder.func_addr(bar);
    builder.jump(b3);
    let mut builder = BasicBlockBuilder::new(proc, b3);
    let fp = builder.phi(Type::Ptr, &[(foo_addr, b1), (bar_addr, b2)]);
    builder.call(Type::Void, Callee::Indirect(fp), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 0.5);
    assert_close(freqs.local_call_frequency(main, bar), 0.5);
}

#[test]
fn indirect_call_through_select() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let foo = module.add_procedure("foo");
    let bar = module.add_procedure("bar");
    for func in [foo, bar] {
        let proc = module.procedure_mut(func);
        let entry = proc.add_block();
        BasicBlockBuilder::new(proc, entry).ret(None);
    }

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    let lhs = builder.param(0, Type::Int64);
    let rhs = builder.param(1, Type::Int64);
    let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
    let foo_addr = builder.func_addr(foo);
    let bar_addr = builder.func_addr(bar);
    let fp = builder.select(cond, foo_addr, bar_addr);
    builder.call(Type::Void, Callee::Indirect(fp), &[]);
    builder.ret(None);

    let options = Options {
        use_points_to_analysis: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.local_call_frequency(main, foo), 0.5);
    assert_close(freqs.local_call_frequency(main, bar), 0.5);
}

#[test]
fn single_block_function() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let freqs = run(&mut module, &Options::default());
    assert_close(
        freqs.block_frequencies(main).unwrap().block_frequency(entry),
        1.0,
    );
}

#[test]
fn straight_line_chain() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let blocks: Vec<_> = (0..5).map(|_| proc.add_block()).collect();
    for window in blocks.windows(2) {
        BasicBlockBuilder::new(proc, window[0]).jump(window[1]);
    }
    BasicBlockBuilder::new(proc, blocks[4]).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    for &block in blocks.iter() {
        assert_close(bf.block_frequency(block), 1.0);
    }
}

/// A loop with no exit edge: the clamp bounds the header's frequency at
/// 1/EPSILON instead of diverging.
#[test]
fn tight_infinite_loop() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    BasicBlockBuilder::new(proc, b0).jump(b1);
    BasicBlockBuilder::new(proc, b1).jump(b1);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    assert_close(
        bf.block_frequency(b1),
        1.0 / (1.0 - (1.0 - larus::EPSILON)),
    );
}

#[test]
fn switch_arms_are_uniform() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let arms: Vec<_> = (0..4).map(|_| proc.add_block()).collect();
    let merge = proc.add_block();

    let mut builder = BasicBlockBuilder::new(proc, b0);
    let selector = builder.param(0, Type::Int32);
    builder.switch(selector, &arms);
    for &arm in arms.iter() {
        BasicBlockBuilder::new(proc, arm).jump(merge);
    }
    BasicBlockBuilder::new(proc, merge).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    for &arm in arms.iter() {
        assert_close(bf.branch_probabilities().edge_probability(b0, arm), 0.25);
        assert_close(bf.block_frequency(arm), 0.25);
    }
    assert_close(bf.block_frequency(merge), 1.0);
}

#[test]
fn function_unreachable_from_root() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let orphan = module.add_procedure("orphan");

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);
    let proc = module.procedure_mut(orphan);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let freqs = run(&mut module, &Options::default());
    assert_close(freqs.invocation_frequency(orphan), 0.0);
    assert_close(freqs.global_block_frequency(orphan, entry), 0.0);

    let options = Options {
        sum_unreached_invocations: true,
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.invocation_frequency(orphan), 0.0);
}

#[test]
fn external_callee_is_a_terminal_sink() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let external = module.declare_function("getchar");

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    builder.call(Type::Int32, Callee::Direct(external), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());
    assert_close(freqs.local_call_frequency(main, external), 1.0);
    assert_close(freqs.invocation_frequency(external), 1.0);
    assert!(freqs.block_frequencies(external).is_none());
}

/// A call to a function that never returns zeroes out everything behind it.
#[test]
fn call_to_exit_kills_successors() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let exit = module.declare_function("exit");
    module.set_no_return(exit);

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    builder.call(Type::Void, Callee::Direct(exit), &[]);
    builder.jump(b1);
    BasicBlockBuilder::new(proc, b1).ret(None);

    let freqs = run(&mut module, &Options::default());
    let bf = freqs.block_frequencies(main).unwrap();
    assert_close(bf.branch_probabilities().edge_probability(b0, b1), 0.0);
    assert_close(bf.block_frequency(b1), 0.0);
}

#[test]
fn cost_report_counts_executed_instructions() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let helper = module.add_procedure("helper");

    let proc = module.procedure_mut(helper);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    builder.call(Type::Void, Callee::Direct(helper), &[]);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    builder.call(Type::Void, Callee::Direct(helper), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());
    let report = larus::estimate_cost(&module, &freqs, &[CostKind::One, CostKind::Latency]);

    // main runs 4 instructions once; helper runs its single return twice.
    let one = report.option(CostKind::One).unwrap();
    assert_close(one.function_cost("main").unwrap(), 4.0);
    assert_close(one.function_cost("helper").unwrap(), 2.0);
    assert_close(one.total, 6.0);

    let yaml = report.to_yaml().unwrap();
    assert!(yaml.contains("Cost_options:"));
    assert!(yaml.contains("Name: One"));
    assert!(yaml.contains("Total cost: 6.0"));
}

#[test]
#[should_panic(expected = "root function")]
fn missing_root_function_is_fatal() {
    let mut module = Module::new();
    let f = module.add_procedure("not_main");
    let proc = module.procedure_mut(f);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);
    let _ = larus::CallFrequencies::new(&mut module, &Options::default());
}

#[test]
fn alternate_root_function() {
    init();
    let mut module = Module::new();
    let start = module.add_procedure("_start");
    let proc = module.procedure_mut(start);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let options = Options {
        root_function: "_start".to_string(),
        ..Options::default()
    };
    let freqs = run(&mut module, &options);
    assert_close(freqs.invocation_frequency(start), 1.0);
}

/// Deep call chain: global frequencies multiply down the chain.
#[test]
fn call_chain_scales_invocation_frequencies() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let mid = module.add_procedure("mid");
    let leaf = module.add_procedure("leaf");

    let proc = module.procedure_mut(leaf);
    let entry = proc.add_block();
    BasicBlockBuilder::new(proc, entry).ret(None);

    let proc = module.procedure_mut(mid);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    builder.call(Type::Void, Callee::Direct(leaf), &[]);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    builder.call(Type::Void, Callee::Direct(leaf), &[]);
    builder.ret(None);

    let proc = module.procedure_mut(main);
    let b0 = proc.add_block();
    let b1 = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, b0);
    builder.call(Type::Void, Callee::Direct(mid), &[]);
    builder.jump(b1);
    let mut builder = BasicBlockBuilder::new(proc, b1);
    builder.call(Type::Void, Callee::Direct(mid), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());
    assert_close(freqs.invocation_frequency(mid), 2.0);
    assert_close(freqs.invocation_frequency(leaf), 4.0);
    assert_close(freqs.global_call_frequency(mid, leaf), 4.0);
}

#[test]
fn mutual_recursion_settles() {
    init();
    let mut module = Module::new();
    let main = module.add_procedure("main");
    let even = module.add_procedure("even");
    let odd = module.add_procedure("odd");

    // even and odd call each other from one arm of a branch.
    for (func, other) in [(even, odd), (odd, even)] {
        let proc = module.procedure_mut(func);
        let b0 = proc.add_block();
        let b1 = proc.add_block();
        let b2 = proc.add_block();
        let mut builder = BasicBlockBuilder::new(proc, b0);
        let lhs = builder.param(0, Type::Int64);
        let rhs = builder.param(1, Type::Int64);
        let cond = builder.icmp(CmpKind::Slt, lhs, rhs);
        builder.branch(cond, b1, b2);
        let mut builder = BasicBlockBuilder::new(proc, b1);
        builder.call(Type::Void, Callee::Direct(other), &[]);
        builder.jump(b2);
        BasicBlockBuilder::new(proc, b2).ret(None);
    }

    let proc = module.procedure_mut(main);
    let entry = proc.add_block();
    let mut builder = BasicBlockBuilder::new(proc, entry);
    builder.call(Type::Void, Callee::Direct(even), &[]);
    builder.ret(None);

    let freqs = run(&mut module, &Options::default());
    assert!(freqs.invocation_frequency(even) >= 1.0);
    assert!(freqs.invocation_frequency(odd) > 0.0);
    assert!(freqs.invocation_frequency(even).is_finite());
    assert!(freqs.invocation_frequency(odd).is_finite());
}
