//! Object constructors, function references, and reference-driven callbacks.

mod common;

use common::{assert_op_sequence, compile, compile_to_text};
use elle_compiler::compiler::module::{CodeLine, Opcode};

#[test]
fn object_constructor_binds_references() {
    let text = compile_to_text(
        "\
o = new {
name: \"n\",
get_name: func(me) => return me.name,
}
emit o.get_name(o)
",
    );
    assert_op_sequence(&text, &["mk_ref.udf", "mk_hash", "bind_refs", "invoke"]);
    assert!(text.contains("mk_ref.udf $lambda_1"));
    assert!(text.contains("bind_refs"));
}

#[test]
fn builder_chains_invoke_repeatedly() {
    let text = compile_to_text(
        "\
counter = new {
n: 0,
bump: func(me)
me.n += 1
return me
end,
}
emit counter.bump(counter).bump(counter).n
",
    );
    assert_op_sequence(&text, &["bind_refs", "invoke", "invoke", "get.index", "emit"]);
    assert!(text.contains("set.op add"));
}

#[test]
fn handler_registration_references_user_functions() {
    let text = compile_to_text(
        "\
func on_tick()
emit \"tick\"
end
add_handler(\"tick\", ref on_tick)
",
    );
    assert_op_sequence(&text, &["mk_ref.udf", "call.native"]);
    assert!(text.contains("mk_ref.udf on_tick"));
    assert!(text.contains("call.native $builtin::add_handler"));
}

#[test]
fn native_function_references_qualify() {
    let text = compile_to_text("f = ref println\ng = ref str.upper\n");
    assert!(text.contains("mk_ref.native $builtin::println"));
    // Unknown module functions become user references for the linker
    assert!(text.contains("mk_ref.udf str::upper"));
}

#[test]
fn lambda_definitions_lift_to_the_top_level() {
    let module = compile(
        "\
apply = func(x)
return x * 2
end
emit apply(21)
",
    );
    assert_eq!(module.functions.len(), 1);
    assert_eq!(module.functions[0].label, "$lambda_1.1");
    // The assignment site loads a reference to the lifted definition
    assert!(module.code_lines.iter().any(|l| matches!(
        l,
        CodeLine::Op { op: Opcode::MkRefUdf, arg: Some(a), .. } if a == "$lambda_1"
    )));
}

#[test]
fn object_methods_can_capture_the_object_by_use() {
    let text = compile_to_text(
        "\
func make()
obj = new {
greet: func() use obj
return obj.name
end,
}
obj.name = \"thing\"
return obj
end
emit make().greet()
",
    );
    // The lambda reads the enclosing function's local through the capture
    assert!(text.contains("load.outer 1:0"));
    assert_op_sequence(&text, &["bind_refs", "set.index", "invoke"]);
}
