use super::*;
use crate::compiler::ast::{BinaryOperator, CatchClause, ParamDecl, SourceLocation, StatementKind};
use crate::compiler::nef::compute_checksum;
use crate::opcodes::{disassemble, DecodedInstruction, OpCode};
use crate::types::ContractParameterType;

fn compile(contract: &ContractDecl) -> CompilationOutput {
    Compiler::new().compile(contract).unwrap()
}

fn decode(output: &CompilationOutput) -> Vec<DecodedInstruction> {
    disassemble(&output.nef.script).unwrap()
}

fn opcodes(decoded: &[DecodedInstruction]) -> Vec<OpCode> {
    decoded.iter().map(|i| i.opcode).collect()
}

fn log(text: &str) -> Statement {
    Statement::expr(Expression::capability("Runtime.Log", vec![Expression::string(text)]))
}

fn hello_contract() -> ContractDecl {
    ContractDecl::new("HelloContract").method(
        MethodDecl::new("SayHello")
            .public()
            .safe()
            .returns(TypeRef::String)
            .body(vec![Statement::return_stmt(Some(Expression::string("Hello, World!")))]),
    )
}

#[test]
fn test_say_hello() {
    let output = compile(&hello_contract());
    // PUSHDATA1 0x0d "Hello, World!", RET
    assert_eq!(hex::encode(&output.nef.script), "0c0d48656c6c6f2c20576f726c642140");

    let method = output.manifest.abi.method("sayHello").unwrap();
    assert_eq!(method.returntype, ContractParameterType::String);
    assert!(method.safe);
    assert_eq!(method.offset, 0);
    assert!(method.parameters.is_empty());
    assert_eq!(output.manifest.name, "HelloContract");
}

#[test]
fn test_model_json_to_artifacts() {
    let json = r#"{
        "name": "HelloContract",
        "supported_standards": ["NEP-17"],
        "methods": [{
            "name": "SayHello",
            "return_type": "string",
            "attributes": { "public": true, "safe": true },
            "body": [{ "kind": "return", "value": { "kind": "string", "value": "Hello, World!" } }]
        }]
    }"#;
    let contract = ContractDecl::from_json(json).unwrap();
    let output = compile(&contract);
    assert_eq!(output.nef.script, hex::decode("0c0d48656c6c6f2c20576f726c642140").unwrap());
    let manifest: serde_json::Value = serde_json::from_str(&output.manifest.to_json().unwrap()).unwrap();
    assert_eq!(manifest["supportedstandards"][0], "NEP-17");
    assert_eq!(manifest["abi"]["methods"][0]["name"], "sayHello");
    assert_eq!(manifest["abi"]["methods"][0]["returntype"], "String");
}

#[test]
fn test_if_else_branch_targets() {
    let x = || Expression::variable("x");
    let contract = ContractDecl::new("Branches").method(
        MethodDecl::new("Pick").public().param("a", TypeRef::Boolean).returns(TypeRef::Integer).body(vec![
            Statement::local("x", TypeRef::Integer, None),
            Statement::if_stmt(
                Expression::variable("a"),
                Statement::block(vec![Statement::expr(Expression::assign(x(), Expression::int(1)))]),
                Some(Statement::block(vec![Statement::expr(Expression::assign(x(), Expression::int(2)))])),
            ),
            Statement::return_stmt(Some(x())),
        ]),
    );
    let output = compile(&contract);
    let decoded = decode(&output);
    assert_eq!(
        opcodes(&decoded),
        vec![
            OpCode::INITSLOT,
            OpCode::LDARG0,
            OpCode::JMPIFNOT,
            OpCode::PUSH1,
            OpCode::STLOC0,
            OpCode::JMP,
            OpCode::PUSH2,
            OpCode::STLOC0,
            OpCode::LDLOC0,
            OpCode::RET,
        ]
    );
    assert_eq!(decoded[2].jump_targets(), vec![Some(decoded[6].offset)]);
    assert_eq!(decoded[5].jump_targets(), vec![Some(decoded[8].offset)]);
    assert_eq!(hex::encode(&output.nef.script), "5701017826061170220412706840");
}

#[test]
fn test_straight_line_round_trip() {
    let a = || Expression::variable("a");
    let contract = ContractDecl::new("Straight").method(MethodDecl::new("Run").public().body(vec![
        Statement::local("a", TypeRef::Integer, Some(Expression::int(5))),
        log("x"),
        Statement::expr(Expression::assign(a(), Expression::binary(a(), BinaryOperator::Add, Expression::int(1)))),
    ]));
    let output = compile(&contract);
    let expected = vec![
        OpCode::INITSLOT,
        OpCode::PUSH5,
        OpCode::STLOC0,
        OpCode::PUSHDATA1,
        OpCode::SYSCALL,
        OpCode::LDLOC0,
        OpCode::PUSH1,
        OpCode::ADD,
        OpCode::STLOC0,
        OpCode::RET,
    ];
    let emitted: Vec<OpCode> = output.blocks[0].instructions.iter().map(|i| i.opcode).collect();
    assert_eq!(emitted, expected);
    assert_eq!(opcodes(&decode(&output)), expected);
}

#[test]
fn test_long_branch_is_relaxed() {
    let logs = (0..70).map(|_| log("x")).collect();
    let contract = ContractDecl::new("Long").method(
        MethodDecl::new("Chatty")
            .public()
            .param("loud", TypeRef::Boolean)
            .body(vec![Statement::if_stmt(Expression::variable("loud"), Statement::block(logs), None)]),
    );
    let output = compile(&contract);
    let decoded = decode(&output);
    assert_eq!(decoded[2].opcode, OpCode::JMPIFNOT_L);
    let ret = decoded.last().unwrap();
    assert_eq!(ret.opcode, OpCode::RET);
    assert_eq!(decoded[2].jump_targets(), vec![Some(ret.offset)]);
    assert_eq!(ret.offset - decoded[2].offset, 5 + 70 * 8);
    let stats = output.blocks[0].stats;
    assert_eq!(stats.widened, 1);
    assert!(stats.passes <= 2);
}

#[test]
fn test_method_tokens_are_shared() {
    let balance = |contract: &str| Expression::capability(format!("{}.BalanceOf", contract), vec![Expression::variable("account")]);
    let contract = ContractDecl::new("Wallet")
        .method(
            MethodDecl::new("Total").public().param("account", TypeRef::Hash160).returns(TypeRef::Integer).body(vec![
                Statement::return_stmt(Some(Expression::binary(
                    Expression::binary(balance("GAS"), BinaryOperator::Add, balance("GAS")),
                    BinaryOperator::Add,
                    balance("NEO"),
                ))),
            ]),
        )
        .method(
            MethodDecl::new("Gas")
                .public()
                .param("account", TypeRef::Hash160)
                .returns(TypeRef::Integer)
                .body(vec![Statement::return_stmt(Some(balance("GAS")))]),
        );
    let output = compile(&contract);
    assert_eq!(output.nef.tokens.len(), 2);
    assert_eq!(output.nef.tokens[0].method, "balanceOf");
    assert_eq!(output.nef.tokens[0].parameters_count, 1);
    assert_ne!(output.nef.tokens[0].hash, output.nef.tokens[1].hash);

    let indices: Vec<Vec<u8>> = decode(&output)
        .into_iter()
        .filter(|i| i.opcode == OpCode::CALLT)
        .map(|i| i.operand)
        .collect();
    assert_eq!(indices, vec![vec![0, 0], vec![0, 0], vec![1, 0], vec![0, 0]]);
}

#[test]
fn test_calls_between_methods() {
    let contract = ContractDecl::new("Calls")
        .method(
            MethodDecl::new("Main")
                .public()
                .returns(TypeRef::Integer)
                .body(vec![Statement::return_stmt(Some(Expression::call("Helper", vec![Expression::int(2)])))]),
        )
        .method(
            MethodDecl::new("Helper")
                .param("x", TypeRef::Integer)
                .returns(TypeRef::Integer)
                .body(vec![Statement::return_stmt(Some(Expression::variable("x")))]),
        );
    let output = compile(&contract);
    // PUSH2, CALL_L +6, RET | INITSLOT 00 01, LDARG0, RET
    assert_eq!(hex::encode(&output.nef.script), "123506000000405700017840");
    assert_eq!(output.assembly.offset_of("Helper"), Some(7));
    assert_eq!(output.manifest.abi.methods.len(), 1, "private methods stay out of the ABI");
}

#[test]
fn test_finally_runs_on_every_exit() {
    let contract = ContractDecl::new("Guard").method(
        MethodDecl::new("Loop")
            .public()
            .param("a", TypeRef::Boolean)
            .param("b", TypeRef::Boolean)
            .returns(TypeRef::Integer)
            .body(vec![
                Statement::while_stmt(
                    Expression::boolean(true),
                    Statement::try_stmt(
                        Statement::block(vec![
                            Statement::if_stmt(Expression::variable("a"), Statement::break_stmt(), None),
                            Statement::if_stmt(Expression::variable("b"), Statement::continue_stmt(), None),
                            Statement::return_stmt(Some(Expression::int(1))),
                        ]),
                        None,
                        Some(Statement::block(vec![log("finally")])),
                    ),
                ),
                Statement::return_stmt(Some(Expression::int(0))),
            ]),
    );
    let output = compile(&contract);
    let decoded = decode(&output);
    let try_instruction = decoded.iter().find(|i| i.opcode == OpCode::TRY).unwrap();
    let protected_start = try_instruction.offset;
    let finally_start = try_instruction.jump_targets()[1].unwrap();

    let protected: Vec<&DecodedInstruction> = decoded
        .iter()
        .filter(|i| i.offset > protected_start && i.offset < finally_start)
        .collect();
    assert_eq!(protected.iter().filter(|i| i.opcode == OpCode::ENDTRY).count(), 3);
    for instruction in protected {
        assert_ne!(instruction.opcode, OpCode::RET, "RET escapes the try at {}", instruction.offset);
        if matches!(instruction.opcode, OpCode::ENDTRY | OpCode::ENDTRY_L) {
            continue;
        }
        for target in instruction.jump_targets().into_iter().flatten() {
            assert!(
                target > protected_start && target <= finally_start,
                "{} jumps out of the try region",
                instruction
            );
        }
    }
}

#[test]
fn test_catch_clause_binds_exception() {
    let contract = ContractDecl::new("Catcher").method(MethodDecl::new("Safe").public().body(vec![Statement::try_stmt(
        Statement::block(vec![Statement::throw(Expression::string("boom"))]),
        Some(CatchClause {
            variable: Some("e".into()),
            body: Box::new(Statement::block(vec![Statement::expr(Expression::capability(
                "Runtime.Log",
                vec![Expression::variable("e")],
            ))])),
        }),
        None,
    )]));
    let output = compile(&contract);
    let decoded = decode(&output);
    assert_eq!(
        opcodes(&decoded),
        vec![
            OpCode::INITSLOT,
            OpCode::TRY,
            OpCode::PUSHDATA1,
            OpCode::THROW,
            OpCode::STLOC0,
            OpCode::LDLOC0,
            OpCode::SYSCALL,
            OpCode::ENDTRY,
            OpCode::RET,
        ]
    );
    assert_eq!(decoded[1].jump_targets(), vec![Some(decoded[4].offset), None]);
    assert_eq!(decoded[7].jump_targets(), vec![Some(decoded[8].offset)]);
}

#[test]
fn test_abi_name_normalization() {
    let contract = ContractDecl::new("Oracle")
        .method(MethodDecl::new("DoRequest").public())
        .method(MethodDecl::new("Callback").public().display_name("onOracleResponse"));
    let output = compile(&contract);
    let names: Vec<&str> = output.manifest.abi.methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["doRequest", "onOracleResponse"]);
    assert_eq!(output.manifest.abi.methods[1].offset, 1);
}

#[test]
fn test_static_fields_get_an_initializer() {
    let contract = ContractDecl::new("Counter")
        .static_field("count", TypeRef::Integer, Some(Expression::int(10)))
        .static_field("paused", TypeRef::Boolean, None)
        .method(
            MethodDecl::new("Get")
                .public()
                .safe()
                .returns(TypeRef::Integer)
                .body(vec![Statement::return_stmt(Some(Expression::variable("count")))]),
        );
    let output = compile(&contract);
    // LDSFLD0, RET | INITSSLOT 02, PUSH10, STSFLD0, PUSHF, STSFLD1, RET
    assert_eq!(hex::encode(&output.nef.script), "584056021a60096140");
    let initialize = output.manifest.abi.method("_initialize").unwrap();
    assert_eq!(initialize.offset, 2);
    assert_eq!(initialize.returntype, ContractParameterType::Void);
}

#[test]
fn test_events_and_debug_map() {
    let contract = ContractDecl::new("Token")
        .event(
            "Transfer",
            vec![
                ParamDecl { name: "from".into(), ty: TypeRef::Hash160 },
                ParamDecl { name: "amount".into(), ty: TypeRef::Integer },
            ],
        )
        .method(
            MethodDecl::new("Emit").public().param("from", TypeRef::Hash160).body(vec![Statement::expr(
                Expression::raise("Transfer", vec![Expression::variable("from"), Expression::int(1)]),
            )
            .at(SourceLocation {
                document: "Token.cs".into(),
                start_line: 12,
                start_column: 13,
                end_line: 12,
                end_column: 40,
            })]),
        );
    let output = Compiler::new().with_debug(true).compile(&contract).unwrap();
    let event = &output.manifest.abi.events[0];
    assert_eq!(event.name, "Transfer");
    assert_eq!(event.parameters[1].ty, ContractParameterType::Integer);

    let debug = output.debug_info.as_ref().unwrap();
    assert_eq!(debug.documents, vec!["Token.cs"]);
    // PUSH1, LDARG0, PUSH2, PACK, PUSHDATA1, SYSCALL; the implicit RET has no source
    let offsets: Vec<_> = debug.methods[0].sequence_points.iter().map(|p| p.split('[').next().unwrap()).collect();
    assert_eq!(offsets, vec!["3", "4", "5", "6", "7", "17"]);
    assert!(debug.methods[0].sequence_points.iter().all(|p| p.ends_with("[0]12:13-12:40")));
    assert_eq!(debug.events[0].params, vec!["from,Hash160,0", "amount,Integer,1"]);

    assert!(Compiler::new().compile(&contract).unwrap().debug_info.is_none());
}

#[test]
fn test_errors_are_batched() {
    let contract = ContractDecl::new("Broken")
        .method(MethodDecl::new("A").body(vec![Statement::new(StatementKind::Unsupported {
            construct: "lock statement".into(),
        })]))
        .method(MethodDecl::new("B").body(vec![Statement::expr(Expression::call("Missing", vec![]))]))
        .method(MethodDecl::new("C").public().body(vec![]));
    let errors = Compiler::new().compile(&contract).unwrap_err();
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors.0[0], CompileError::Unsupported { .. }));
    assert!(matches!(errors.0[1], CompileError::UnresolvedReference { .. }));
    assert!(errors.to_string().starts_with("2 errors:"));
}

#[test]
fn test_overloads_are_rejected() {
    let contract = ContractDecl::new("Twice").method(MethodDecl::new("Run")).method(MethodDecl::new("Run"));
    let errors = Compiler::new().compile(&contract).unwrap_err();
    assert!(errors.to_string().contains("overloaded method 'Run'"));
}

#[test]
fn test_nef_container_round_trip() {
    let output = Compiler::new()
        .with_compiler_name("nccs-test")
        .with_source_url("https://example.org/hello")
        .compile(&hello_contract())
        .unwrap();
    let bytes = output.nef.to_bytes();
    assert_eq!(&bytes[..4], b"NEF3");
    let checksum = u32::from_le_bytes([
        bytes[bytes.len() - 4],
        bytes[bytes.len() - 3],
        bytes[bytes.len() - 2],
        bytes[bytes.len() - 1],
    ]);
    assert_eq!(checksum, compute_checksum(&bytes[..bytes.len() - 4]));

    let parsed = CompiledScript::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.compiler, "nccs-test");
    assert_eq!(parsed.source, "https://example.org/hello");
    assert_eq!(parsed, output.nef);
}

#[test]
fn test_model_tokens_survive_the_container() {
    let with_token = |method: &str| {
        let mut contract = ContractDecl::new("Deployer").method(
            MethodDecl::new("Run")
                .public()
                .body(vec![Statement::expr(Expression::capability("Management.Call", vec![]))]),
        );
        contract.capabilities = serde_json::from_value(serde_json::json!([{
            "name": "Management.Call",
            "returns_value": false,
            "binding": "token",
            "contract": crate::compiler::catalog::CONTRACT_MANAGEMENT,
            "method": method,
        }]))
        .unwrap();
        Compiler::new().compile(&contract)
    };

    let errors = with_token("_deploy").unwrap_err();
    assert!(matches!(errors.0[0], CompileError::Unsupported { .. }));
    assert!(errors.to_string().contains("'_deploy' is reserved"));

    let output = with_token("getMinimumDeploymentFee").unwrap();
    assert_eq!(output.nef.tokens[0].method, "getMinimumDeploymentFee");
    assert_eq!(CompiledScript::from_bytes(&output.nef.to_bytes()).unwrap(), output.nef);
}

#[test]
fn test_write_artifacts() {
    let dir = std::env::temp_dir().join(format!("nccs-artifacts-{}", std::process::id()));
    let output = Compiler::new().with_debug(true).compile(&hello_contract()).unwrap();
    let written = output.write_artifacts(&dir, "Hello").unwrap();
    let names: Vec<String> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Hello.nef", "Hello.manifest.json", "Hello.debug.json"]);
    let nef = CompiledScript::from_bytes(&std::fs::read(dir.join("Hello.nef")).unwrap()).unwrap();
    assert_eq!(nef, output.nef);
    std::fs::remove_dir_all(&dir).unwrap();
}
