//! End-to-end checks of the opcode sequences the code generator produces for
//! the core language constructs.

mod common;

use common::{assert_op_sequence, compile, compile_to_text};
use elle_compiler::compiler::module::{CodeLine, Opcode};

#[test]
fn elseif_chain_jumps_to_each_branch() {
    let text = compile_to_text(
        "\
x = 50
if x <= 0
emit \"none\"
elsif x < 10
emit \"few\"
elsif x <= 100
emit \"some\"
elsif x <= 1000
emit \"many\"
else
emit \"lots\"
end
",
    );
    assert_op_sequence(&text, &["jmple", "jmplt", "jmple", "jmple"]);
    // The else body falls through before the labelled branches
    assert!(text.contains("IF_C_100001_1:"));
    assert!(text.contains("IF_END_100001:"));
}

#[test]
fn elseif_without_else_inverts_comparisons() {
    let text = compile_to_text(
        "\
x = 5
if x < 10
emit \"small\"
elsif x == 10
emit \"ten\"
end
",
    );
    // `<` falls through on `>=`, `==` on `!=`
    assert_op_sequence(&text, &["jmpge", "jmpne"]);
}

#[test]
fn compound_assignment_expands_to_math_and_store() {
    let text = compile_to_text("a = 0\na += 1\na -= 1\n");
    assert_op_sequence(
        &text,
        &["load", "load", "add", "store", "load", "load", "sub", "store"],
    );
}

#[test]
fn string_interpolation_compiles_to_concat_chain() {
    let text = compile_to_text("name = \"World\"\nemit \"Hello, ${name}!\"\n");
    assert_op_sequence(&text, &["concat", "concat", "emit"]);

    let text = compile_to_text("a = 1\nb = 2\nemit \"sum of ${a} and ${b}\"\n");
    assert_op_sequence(&text, &["concat", "concat", "concat", "emit"]);
}

#[test]
fn foreach_drives_the_iterator_protocol() {
    let text = compile_to_text("xs = [1, 2, 3]\nfor xs as x\nemit x\nend\n");
    assert_op_sequence(&text, &["call.native", "call.native", "call.native", "unload"]);
    assert!(text.contains("call.native _iter_create$"));
    assert!(text.contains("call.native _iter_hasnext$"));
    assert!(text.contains("call.native _iter_next$"));
    assert!(text.contains("jmpne FOR_END_100001"));
}

#[test]
fn literal_arrays_pool_into_constant_data() {
    let module = compile("a = [1, 2, 3]\n");
    assert_eq!(module.const_data, vec!["1 2 3"]);
    let text = module.render();
    assert!(text.contains(".data\n1 2 3\n"));
    assert!(text.contains("load.const 0"));
    assert!(!text.contains("mk_array"));
}

#[test]
fn mixed_arrays_build_at_runtime() {
    let text = compile_to_text("b = 2\na = [1, b, 3]\n");
    assert!(text.contains("mk_array 3"));
    assert!(!text.contains(".data"));
}

#[test]
fn string_literal_arrays_pool_verbatim() {
    let module = compile("a = [\"x\", \"y\"]\n");
    assert_eq!(module.const_data, vec!["\"x\" \"y\""]);
}

#[test]
fn hash_literals_push_keys_then_values() {
    let text = compile_to_text("h = { one: 1, two: 2 }\n");
    assert_op_sequence(&text, &["load", "load", "load", "load", "mk_hash"]);
    assert!(text.contains("load \"one\""));
    assert!(text.contains("mk_hash 2"));
}

#[test]
fn dynamic_calls_invoke_through_the_stack() {
    let text = compile_to_text(
        "\
f = ref println
f(1)
h = { cb: ref println }
h.cb(2)
",
    );
    assert_op_sequence(&text, &["mk_ref.native", "invoke", "mk_hash", "get.index", "invoke"]);
    assert!(text.contains("mk_ref.native $builtin::println"));
}

#[test]
fn static_builtin_calls_use_call_native() {
    let text = compile_to_text("println(\"hi\")\n");
    assert_op_sequence(&text, &["load", "call.native"]);
    assert!(text.contains("call.native $builtin::println"));
}

#[test]
fn if_expression_generates_a_true_branch_label() {
    let text = compile_to_text("x = 1\ny = if(x < 5, 10, 20)\n");
    assert_op_sequence(&text, &["jmplt", "load", "jmp", "load", "store"]);
    assert!(text.contains("IFE_TB_100001:"));
    assert!(text.contains("IFE_END_100001:"));
}

#[test]
fn conditional_loop_shape() {
    let text = compile_to_text("i = 0\nfor i < 10\ni += 1\nend\n");
    assert!(text.contains("FOR_COND_100001:"));
    assert!(text.contains("jmplt FOR_LOOP_100001"));
    assert!(text.contains("jmp FOR_END_100001"));
    assert!(text.contains("FOR_LOOP_100001:"));
    assert!(text.contains("jmp FOR_COND_100001"));
    assert!(text.contains("FOR_END_100001:"));
}

#[test]
fn outer_capture_reads_through_load_outer() {
    let module = compile(
        "\
func outer()
x = 5
f = func() use x
return x
end
return f()
end
emit outer()
",
    );
    let lambda = module
        .functions
        .iter()
        .find(|f| f.label == "$lambda_1.0")
        .unwrap();
    assert!(lambda.ops.iter().any(|op| matches!(
        op,
        CodeLine::Op { op: Opcode::LoadOuter, arg: Some(a), .. } if a == "1:0"
    )));
}

#[test]
fn function_stores_stay_within_local_slots() {
    let module = compile(
        "\
func calc(a, b)
sum = a + b
diff = a - b
return sum * diff
end
emit calc(3, 4)
",
    );
    let func = &module.functions[0];
    // Two parameters plus two locals
    let local_count = 4;
    for op in &func.ops {
        if let CodeLine::Op {
            op: Opcode::Store,
            arg: Some(arg),
            ..
        } = op
        {
            assert!(arg.parse::<usize>().unwrap() < local_count);
        }
        if let CodeLine::Op {
            op: Opcode::Load,
            arg: Some(arg),
            ..
        } = op
        {
            if let Some(slot) = arg.strip_prefix('#') {
                assert!(slot.parse::<usize>().unwrap() < local_count);
            }
        }
    }
}

#[test]
fn logic_operators_emit_their_keyword() {
    let text = compile_to_text("a = true and false or true xor false\n");
    assert_op_sequence(&text, &["and", "or", "xor"]);
}

#[test]
fn not_negates_after_evaluation() {
    let text = compile_to_text("x = 1\ny = not x == 1\n");
    assert_op_sequence(&text, &["load", "load", "eq", "not", "store"]);
}

#[test]
fn unary_minus_multiplies_by_minus_one() {
    let text = compile_to_text("x = 1\ny = -(x + 1)\n");
    assert_op_sequence(&text, &["load", "load", "add", "load", "mul", "store"]);
    assert!(text.contains("load -1"));
}

#[test]
fn emit_carries_an_optional_name() {
    let text = compile_to_text("emit 42 as answer\nemit 43\n");
    assert!(text.contains("emit \"answer\""));
    assert_op_sequence(&text, &["load", "emit", "load", "emit"]);
}

#[test]
fn element_assignment_forms() {
    let text = compile_to_text(
        "\
h = { n: 1 }
h[\"n\"] = 2
h.n += 3
k = \"n\"
h[k] = 4
",
    );
    assert!(text.contains("set.index \"n\""));
    assert!(text.contains("set.op add"));
    assert_op_sequence(&text, &["set.index", "set.op", "set"]);
}

#[test]
fn debug_annotations_name_module_and_line() {
    let text = compile_to_text("a = 1\n");
    assert!(text.contains("load 1 ; #main(1)"));
    assert!(text.contains("store 0 ; #main(1)"));
}

#[test]
fn return_without_value_emits_bare_ret() {
    let module = compile("func noop()\nreturn\nend\nnoop()\n");
    let func = &module.functions[0];
    assert_eq!(func.ops.len(), 1);
    assert!(matches!(
        func.ops[0],
        CodeLine::Op {
            op: Opcode::Ret,
            arg: None,
            ..
        }
    ));
}
