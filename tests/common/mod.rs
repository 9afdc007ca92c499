#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mutator::bytecode::Module;
use serde_json::json;

fn sp(line: u32) -> serde_json::Value {
    json!({
        "document": "Calc.cs",
        "start_line": line,
        "start_column": 9,
        "end_line": line,
        "end_column": 30
    })
}

/// `Add(a, b) = a + b`, `Max(a, b)`, a static counter, a method shuffling
/// locals, and a method no test calls.
pub fn calc_json() -> serde_json::Value {
    json!({
        "name": "Calc",
        "fields": [
            { "name": "count", "ty": "int64", "initial": 0 }
        ],
        "methods": [
            {
                "name": "Add",
                "parameters": [
                    { "name": "a", "ty": "int64" },
                    { "name": "b", "ty": "int64" }
                ],
                "returns": "int64",
                "body": {
                    "instructions": [
                        { "offset": 0, "opcode": "ldarg.0", "sequence_point": sp(10) },
                        { "offset": 1, "opcode": "ldarg.1" },
                        { "offset": 2, "opcode": "add" },
                        { "offset": 3, "opcode": "ret" }
                    ]
                }
            },
            {
                "name": "Max",
                "parameters": [
                    { "name": "a", "ty": "int64" },
                    { "name": "b", "ty": "int64" }
                ],
                "returns": "int64",
                "body": {
                    "instructions": [
                        { "offset": 0, "opcode": "ldarg.0", "sequence_point": sp(20) },
                        { "offset": 1, "opcode": "ldarg.1" },
                        { "offset": 2, "opcode": "cgt" },
                        { "offset": 3, "opcode": "brfalse.s", "operand": { "target": 6 } },
                        { "offset": 4, "opcode": "ldarg.0", "sequence_point": sp(21) },
                        { "offset": 5, "opcode": "ret" },
                        { "offset": 6, "opcode": "ldarg.1", "sequence_point": sp(22) },
                        { "offset": 7, "opcode": "ret" }
                    ]
                }
            },
            {
                "name": "Increment",
                "returns": "int64",
                "body": {
                    "instructions": [
                        { "offset": 0, "opcode": "ldsfld", "operand": { "field": "count" }, "sequence_point": sp(30) },
                        { "offset": 5, "opcode": "ldc.i4.1" },
                        { "offset": 6, "opcode": "add" },
                        { "offset": 7, "opcode": "stsfld", "operand": { "field": "count" } },
                        { "offset": 12, "opcode": "ldsfld", "operand": { "field": "count" }, "sequence_point": sp(31) },
                        { "offset": 17, "opcode": "ret" }
                    ]
                }
            },
            {
                "name": "Double",
                "parameters": [
                    { "name": "a", "ty": "int64" }
                ],
                "returns": "int64",
                "body": {
                    "locals": [
                        { "name": "t0", "ty": "int64" },
                        { "name": "t1", "ty": "int64" }
                    ],
                    "instructions": [
                        { "offset": 0, "opcode": "ldarg.0", "sequence_point": sp(40) },
                        { "offset": 1, "opcode": "stloc.0" },
                        { "offset": 2, "opcode": "ldloc.0" },
                        { "offset": 3, "opcode": "ldc.i4.2" },
                        { "offset": 4, "opcode": "mul" },
                        { "offset": 5, "opcode": "stloc.1" },
                        { "offset": 6, "opcode": "ldloc.1", "sequence_point": sp(41) },
                        { "offset": 7, "opcode": "ret" }
                    ]
                }
            },
            {
                "name": "Mask",
                "parameters": [
                    { "name": "x", "ty": "int64" }
                ],
                "returns": "int64",
                "body": {
                    "instructions": [
                        { "offset": 0, "opcode": "ldarg.0", "sequence_point": sp(50) },
                        { "offset": 1, "opcode": "ldc.i4.1" },
                        { "offset": 2, "opcode": "or" },
                        { "offset": 3, "opcode": "ret" }
                    ]
                }
            },
            {
                "name": "Extern",
                "parameters": [],
                "returns": "int64"
            }
        ]
    })
}

pub fn calc_module() -> Module {
    let mut module: Module = serde_json::from_value(calc_json()).unwrap();
    module.simplify();
    module
}

/// Suite covering `Add` with `add_case` and `Max`/`Increment`/`Double`
/// with passing tests. `Mask` has no tests.
pub fn suite_json(add_case: (i64, i64, i64)) -> serde_json::Value {
    let (a, b, sum) = add_case;
    json!({
        "module": "bin/Calc.json",
        "tests": [
            {
                "name": "AddTest",
                "steps": [ { "call": "Add", "args": [a, b], "expect": sum } ]
            },
            {
                "name": "MaxTest",
                "steps": [
                    { "call": "Max", "args": [1, 2], "expect": 2 },
                    { "call": "Max", "args": [5, 3], "expect": 5 }
                ]
            },
            {
                "name": "CounterTest",
                "steps": [
                    { "call": "Increment", "expect": 1 },
                    { "call": "Increment", "expect": 2 }
                ]
            },
            {
                "name": "DoubleTest",
                "covers": ["Double"],
                "steps": [ { "call": "Double", "args": [4], "expect": 8 } ]
            }
        ]
    })
}

/// Write the Calc module and a suite into `dir`; returns the suite path.
pub fn write_project(dir: &Path, suite: serde_json::Value) -> PathBuf {
    std::fs::create_dir_all(dir.join("bin")).unwrap();
    std::fs::write(
        dir.join("bin").join("Calc.json"),
        serde_json::to_string_pretty(&calc_json()).unwrap(),
    )
    .unwrap();
    let suite_path = dir.join("Calc.tests.json");
    std::fs::write(&suite_path, serde_json::to_string_pretty(&suite).unwrap()).unwrap();
    suite_path
}

pub fn body_of<'m>(module: &'m Module, method: &str) -> &'m mutator::bytecode::MethodBody {
    module.method(method).unwrap().body.as_ref().unwrap()
}
