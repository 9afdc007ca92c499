pub mod bytecode;
pub mod config;
pub mod copy_tree;
pub mod dispatcher;
pub mod interpreter;
pub mod mutants;
pub mod operators;
pub mod output;
pub mod report;
pub mod runner;
pub mod state;
pub mod suite;
pub mod turtles;
pub mod variables;
pub mod wire;
pub mod worker;
