pub mod commands;
pub mod engine;
pub mod expr;
pub mod flow;
pub mod header;
pub mod interpret;
pub mod labels;
pub mod lexer;
pub mod line;
pub mod loader;
pub mod parser;
pub mod preprocess;
pub mod process;
pub mod types;
mod util;
pub mod validate;
pub mod vars;
pub mod vm;

pub use engine::{
    EmptyCallback, MEraEngine, MEraEngineBuilder, MEraEngineConfig, MEraEngineError,
    MEraEngineSysCallback,
};
pub use flow::EraPhase;
pub use types::{
    Diagnostic, DiagnosticEntry, DiagnosticLevel, EraCallSite, EraDiagCategory,
    EraExecutionBreakReason, EraFaultKind, EraInputValue, EraPrintExtendedFlags, EraRuntimeError,
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use indoc::indoc;
    use itertools::Itertools;

    use super::*;
    use crate::validate::EraUnreferencedPolicy;

    #[derive(Default)]
    struct MockEngineCallback {
        output: String,
        diags: Vec<DiagnosticEntry>,
        errors: Vec<EraRuntimeError>,
        watchdog_calls: u32,
    }
    impl MEraEngineSysCallback for MockEngineCallback {
        fn on_error(&mut self, diag: &Diagnostic) {
            self.diags.extend(diag.entries().iter().cloned());
        }
        fn on_print(&mut self, content: &str, flags: EraPrintExtendedFlags) {
            self.output += content;
            if flags.is_line() {
                self.output.push('\n');
            }
        }
        fn on_runtime_error(&mut self, error: &EraRuntimeError) {
            self.errors.push(error.clone());
        }
        fn on_watchdog(&mut self, _idle_ms: u64) -> bool {
            self.watchdog_calls += 1;
            self.watchdog_calls >= 2
        }
    }

    fn build_with(
        files: &[(&str, &str)],
        config: MEraEngineConfig,
    ) -> anyhow::Result<MEraEngine<MockEngineCallback>> {
        _ = env_logger::builder().is_test(true).try_init();
        let mut builder = MEraEngineBuilder::new(MockEngineCallback::default()).with_config(config);
        for (name, src) in files {
            if name.ends_with(".ERH") {
                builder.load_erh(name, src.as_bytes())?;
            } else {
                builder.load_erb(name, src.as_bytes())?;
            }
        }
        Ok(builder.build()?)
    }

    fn build(files: &[(&str, &str)]) -> anyhow::Result<MEraEngine<MockEngineCallback>> {
        build_with(files, MEraEngineConfig::default())
    }

    fn run(engine: &mut MEraEngine<MockEngineCallback>) -> anyhow::Result<EraExecutionBreakReason> {
        let run_flag = AtomicBool::new(true);
        Ok(engine.do_execution(&run_flag, 100_000)?)
    }

    fn take_output(engine: &mut MEraEngine<MockEngineCallback>) -> String {
        std::mem::take(&mut engine.callback_mut().output)
    }

    const BEGIN_FIRST: (&str, &str) = ("TITLE.ERB", "@SYSTEM_TITLE\nBEGIN FIRST\n");

    #[test]
    fn hello_function_prints_and_returns() -> anyhow::Result<()> {
        let config = MEraEngineConfig {
            analysis_mode: true,
            ..Default::default()
        };
        let mut engine = build_with(
            &[(
                "TEST.ERB",
                indoc! {"
                    @TEST
                        PRINTFORM Hello
                        RETURN
                "},
            )],
            config,
        )?;
        assert!(engine.callback().diags.is_empty(), "{:?}", engine.callback().diags);
        engine.call_function("test")?;
        assert_eq!(engine.callback().output, "Hello");
        assert!(engine.current_position().is_none());
        assert_eq!(engine.current_phase(), EraPhase::TitleBegin);
        assert!(engine.call_function("MISSING").is_err());
        Ok(())
    }

    #[test]
    fn events_run_pri_normal_later_whatever_the_load_order() -> anyhow::Result<()> {
        let files = [
            ("A.ERB", "@EVENTFIRST\n#LATER\nPRINTL later\n"),
            ("B.ERB", "@EVENTFIRST\nPRINTL normal\n"),
            ("C.ERB", "@EVENTFIRST\n#PRI\nPRINTL pri\n"),
        ];
        for order in files.iter().copied().permutations(files.len()) {
            let mut all = vec![BEGIN_FIRST];
            all.extend(order);
            let mut engine = build(&all)?;
            assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
            assert_eq!(engine.callback().output, "pri\nnormal\nlater\n");
        }
        Ok(())
    }

    #[test]
    fn handled_single_skips_the_rest_of_its_group() -> anyhow::Result<()> {
        let mut engine = build(&[
            BEGIN_FIRST,
            (
                "A.ERB",
                indoc! {"
                    @EVENTFIRST
                    #PRI
                    #SINGLE
                        PRINTL first
                        RETURN 1
                "},
            ),
            ("B.ERB", "@EVENTFIRST\n#PRI\nPRINTL skipped\n"),
            ("C.ERB", "@EVENTFIRST\nPRINTL normal\n"),
        ])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(engine.callback().output, "first\nnormal\n");
        Ok(())
    }

    #[test]
    fn only_runs_alone() -> anyhow::Result<()> {
        let mut engine = build(&[
            BEGIN_FIRST,
            ("A.ERB", "@EVENTFIRST\n#PRI\nPRINTL pri\n"),
            ("B.ERB", "@EVENTFIRST\n#ONLY\nPRINTL only\n"),
            ("C.ERB", "@EVENTFIRST\n#LATER\nPRINTL later\n"),
        ])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(engine.callback().output, "only\n");
        Ok(())
    }

    #[test]
    fn omitted_arguments_take_defaults() -> anyhow::Result<()> {
        let src = indoc! {"
            @SYSTEM_TITLE
                CALL F(7)
                PRINTFORML {A} {B}
                CALL G
                PRINTFORML {A} {B}
                QUIT
            @F(A, B = 5)
            @G(A = 1, B = 2)
        "};

        let mut engine = build(&[("MAIN.ERB", src)])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeThrows);
        assert_eq!(engine.callback().output, "7 5\n");
        let error = engine.last_runtime_error().expect("fault recorded");
        assert!(error.msg.contains("expects arguments"), "{}", error.msg);
        assert_eq!(error.site.func_name.as_str(), "SYSTEM_TITLE");

        let config = MEraEngineConfig {
            compat_optional_args: true,
            ..Default::default()
        };
        let mut engine = build_with(&[("MAIN.ERB", src)], config.clone())?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(engine.callback().output, "7 5\n1 2\n");

        let no_default = indoc! {"
            @SYSTEM_TITLE
                CALL F
            @F(A, B = 5)
        "};
        let mut engine = build_with(&[("MAIN.ERB", no_default)], config)?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeThrows);
        let error = &engine.callback().errors[0];
        assert!(error.msg.contains("no default"), "{}", error.msg);
        Ok(())
    }

    #[test]
    fn runaway_recursion_is_a_scripted_fault() -> anyhow::Result<()> {
        let mut engine = build(&[(
            "MAIN.ERB",
            indoc! {"
                @SYSTEM_TITLE
                    A = DEEP(0)
                    QUIT
                @DEEP(X)
                #FUNCTION
                    RETURNF DEEP(X + 1)
            "},
        )])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeThrows);
        let error = engine.last_runtime_error().expect("fault recorded");
        assert_eq!(error.kind, EraFaultKind::Scripted);
        assert!(error.msg.contains("probable infinite recursion"), "{}", error.msg);
        assert_eq!(error.site.func_name.as_str(), "DEEP");
        assert!(!error.call_chain.is_empty());

        let mut engine = build(&[("MAIN.ERB", "@SYSTEM_TITLE\nCALL SYSTEM_TITLE\n")])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeThrows);
        let error = engine.last_runtime_error().expect("fault recorded");
        assert!(error.msg.contains("probable infinite recursion"), "{}", error.msg);
        assert_eq!(engine.current_phase(), EraPhase::Quit);
        Ok(())
    }

    #[test]
    fn header_constants_resolve_in_any_order() -> anyhow::Result<()> {
        let forward = "#DIM CONST CA = CB + 1\n#DIM CONST CB = 2\n";
        let backward = "#DIM CONST CB = 2\n#DIM CONST CA = CB + 1\n";
        for src in [forward, backward] {
            let engine = build(&[("CONST.ERH", src)])?;
            assert_eq!(engine.get_int_var("CA", &[0])?, 3);
            assert_eq!(engine.get_int_var("CB", &[0])?, 2);
        }

        let mut builder = MEraEngineBuilder::new(MockEngineCallback::default());
        builder.load_erh("BAD.ERH", b"#DIM CONST CX = CY + 1\n")?;
        assert!(builder.build().is_err());
        Ok(())
    }

    #[test]
    fn scalar_constants_are_macros_and_globals() -> anyhow::Result<()> {
        let header = indoc! {r#"
            #DIM CONST SIZE = 5
            #DIMS CONST TITLE = "Era"
            #DIM CONST NEG = -SIZE
        "#};
        let script = indoc! {"
            @SYSTEM_TITLE
                PRINTFORML {SIZE} %TITLE% {NEG + 1}
                QUIT
        "};
        let mut engine = build(&[("CONST.ERH", header), ("MAIN.ERB", script)])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(engine.callback().output, "5 Era -4\n");
        assert_eq!(engine.get_int_var("SIZE", &[0])?, 5);
        assert_eq!(engine.get_str_var("TITLE", &[0])?, "Era");
        assert_eq!(engine.get_int_var("NEG", &[0])?, -5);
        Ok(())
    }

    #[test]
    fn failed_host_calls_leave_the_suspended_run_alone() -> anyhow::Result<()> {
        let mut engine = build(&[(
            "MAIN.ERB",
            indoc! {"
                @SYSTEM_TITLE
                    INPUT
                    PRINTFORML after {RESULT}
                    QUIT
                @BAD
                    THROW boom
                @STOP
                    PRINTL stopping
                    QUIT
            "},
        )])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        let phase = engine.current_phase();

        assert!(engine.call_function("BAD").is_err());
        assert_eq!(engine.current_phase(), phase);
        let position = engine.current_position().expect("still inside SYSTEM_TITLE");
        assert_eq!(position.func_name.as_str(), "SYSTEM_TITLE");
        assert_eq!(engine.last_runtime_error().map(|x| x.msg.as_str()), Some("boom"));

        assert!(engine.call_function("STOP").is_err());
        assert_eq!(engine.current_phase(), phase);
        assert_eq!(take_output(&mut engine), "stopping\n");

        engine.push_input(EraInputValue::Int(5))?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(take_output(&mut engine), "after 5\n");
        assert_eq!(engine.current_phase(), EraPhase::Quit);
        Ok(())
    }

    #[test]
    fn watchdog_aborts_when_the_host_says_so() -> anyhow::Result<()> {
        let config = MEraEngineConfig {
            watchdog_timeout_ms: 1,
            ..Default::default()
        };
        let mut engine = build_with(&[("MAIN.ERB", "@SYSTEM_TITLE\nWHILE 1\nWEND\n")], config)?;
        let run_flag = AtomicBool::new(true);
        let reason = engine.do_execution(&run_flag, u64::MAX)?;
        assert_eq!(reason, EraExecutionBreakReason::WatchdogAbort);
        assert_eq!(engine.callback().watchdog_calls, 2);
        Ok(())
    }

    #[test]
    fn purchases_never_overflow() -> anyhow::Result<()> {
        let mut engine = build(&[(
            "SHOP.ERB",
            indoc! {"
                @SYSTEM_TITLE
                    MONEY = 9223372036854775807
                    ITEMSALES:3 = 1
                    ITEMPRICE:3 = -1
                    ITEMSALES:4 = 1
                    ITEM:4 = 9223372036854775807
                    ITEMSALES:5 = 1
                    ITEMPRICE:5 = 10
                    BEGIN SHOP
                @SHOW_SHOP
                @USERSHOP
                    PRINTFORML user {RESULT}
            "},
        )])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(engine.current_phase(), EraPhase::ShopWaitInput);

        for item in [3, 4] {
            engine.push_input(EraInputValue::Int(item))?;
            assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
            assert_eq!(take_output(&mut engine), format!("user {item}\n"));
        }
        assert_eq!(engine.get_int_var("MONEY", &[0])?, i64::MAX);
        assert_eq!(engine.get_int_var("ITEM", &[4])?, i64::MAX);

        engine.push_input(EraInputValue::Int(5))?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(take_output(&mut engine), "");
        assert_eq!(engine.get_int_var("MONEY", &[0])?, i64::MAX - 10);
        assert_eq!(engine.get_int_var("ITEM", &[5])?, 1);
        assert_eq!(engine.get_int_var("BOUGHT", &[0])?, 5);
        Ok(())
    }

    #[test]
    fn title_menu_and_input_drive_the_flow() -> anyhow::Result<()> {
        let mut engine = build(&[(
            "MAIN.ERB",
            indoc! {"
                @EVENTFIRST
                    PRINTL first
                    INPUT
                    PRINTFORML got {RESULT}
                    BEGIN SHOP
                @EVENTSHOP
                    PRINTL shop
                    QUIT
            "},
        )])?;

        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(take_output(&mut engine), "[0] New game\n[1] Load game\n");
        assert_eq!(engine.current_phase(), EraPhase::TitleWaitInput);

        engine.push_input(EraInputValue::Int(0))?;
        assert!(engine.push_input(EraInputValue::Int(1)).is_err());
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(take_output(&mut engine), "first\n");
        let position = engine.current_position().expect("suspended inside EVENTFIRST");
        assert_eq!(position.func_name.as_str(), "EVENTFIRST");

        engine.push_input(EraInputValue::Str("42".to_owned()))?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(take_output(&mut engine), "got 42\nshop\n");
        assert_eq!(engine.current_phase(), EraPhase::Quit);
        assert!(engine.callback().errors.is_empty());
        Ok(())
    }

    #[test]
    fn train_offers_only_able_commands() -> anyhow::Result<()> {
        let mut engine = build(&[(
            "TRAIN.ERB",
            indoc! {"
                @SYSTEM_TITLE
                    BEGIN TRAIN
                @COM1
                    PRINTL one
                @COM2
                    PRINTL two
                @COM_ABLE2
                    RETURN 0
                @USERCOM
                    QUIT
            "},
        )])?;

        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(engine.current_phase(), EraPhase::TrainWaitInput);
        assert_eq!(take_output(&mut engine), "[1] COM1\n");

        engine.push_input(EraInputValue::Int(1))?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::WaitingForInput);
        assert_eq!(take_output(&mut engine), "one\n[1] COM1\n");
        assert_eq!(engine.get_int_var("SELECTCOM", &[0])?, 1);

        engine.push_input(EraInputValue::Int(2))?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeQuit);
        assert_eq!(take_output(&mut engine), "");
        assert_eq!(engine.get_int_var("RESULT", &[0])?, 2);
        Ok(())
    }

    #[test]
    fn missing_eventfirst_is_a_fault() -> anyhow::Result<()> {
        let mut engine = build(&[BEGIN_FIRST])?;
        assert_eq!(run(&mut engine)?, EraExecutionBreakReason::CodeThrows);
        let error = engine.last_runtime_error().expect("fault recorded");
        assert!(error.msg.contains("EVENTFIRST"), "{}", error.msg);
        assert_eq!(error.site.func_name.as_str(), "<flow>");
        Ok(())
    }

    #[test]
    fn unreferenced_functions_follow_the_policy() -> anyhow::Result<()> {
        let files = [("MAIN.ERB", "@SYSTEM_TITLE\nQUIT\n@UNUSED\nA = 42\n@BROKEN\nIF 1\n")];
        let count_unreferenced = |engine: &MEraEngine<MockEngineCallback>| {
            engine
                .callback()
                .diags
                .iter()
                .filter(|x| x.category == EraDiagCategory::Unreferenced)
                .count()
        };

        let engine = build(&files)?;
        assert_eq!(count_unreferenced(&engine), 2);

        let config = MEraEngineConfig {
            unreferenced_policy: EraUnreferencedPolicy::Ignore,
            ..Default::default()
        };
        let mut engine = build_with(&files, config)?;
        assert!(engine.callback().diags.is_empty(), "{:?}", engine.callback().diags);

        engine.call_function("UNUSED")?;
        assert_eq!(engine.get_int_var("A", &[0])?, 42);
        assert!(engine.callback().diags.is_empty());

        assert!(engine.call_function("BROKEN").is_err());
        assert!(engine
            .callback()
            .diags
            .iter()
            .any(|x| x.category == EraDiagCategory::Nesting));
        Ok(())
    }

    #[test]
    fn ignored_categories_never_reach_the_host() -> anyhow::Result<()> {
        let config = MEraEngineConfig {
            ignored_diag_categories: EraDiagCategory::Unreferenced.into(),
            ..Default::default()
        };
        let engine = build_with(&[("MAIN.ERB", "@SYSTEM_TITLE\nQUIT\n@UNUSED\n")], config)?;
        assert!(engine.callback().diags.is_empty());
        assert!(MEraEngine::<EmptyCallback>::get_version().starts_with("MEraScriptCore"));
        Ok(())
    }
}
