//! End-to-end scenarios: compile BASIC to Lua, execute through the embedded
//! runtime, and assert on captured terminal output.

use basic_runtime::ExecConfig;
use fbc::config::CompilerConfig;
use std::path::Path;

fn compile(src: &str, config: &CompilerConfig) -> fbc::CompileOutput {
    match fbc::compile_source(src, Path::new("."), config) {
        Ok(out) => out,
        Err(diags) => panic!("compile failed:\n{}", fbc::format_diagnostics(&diags)),
    }
}

fn run_with(src: &str, config: &CompilerConfig, input: &[&str]) -> Result<String, String> {
    let out = compile(src, config);
    basic_runtime::execute(
        &out.lua,
        ExecConfig {
            capture_output: true,
            scripted_input: input.iter().map(|s| s.to_string()).collect(),
            constants: out.constants.values().to_vec(),
            interrupt: None,
        },
    )
    .map(|r| r.output.unwrap_or_default())
}

fn run(src: &str) -> String {
    match run_with(src, &CompilerConfig::default(), &[]) {
        Ok(output) => output,
        Err(e) => panic!("run failed: {}", e),
    }
}

// -- spec scenarios ---------------------------------------------------------

#[test]
fn mathematical_constants() {
    assert_eq!(run("10 PRINT INT(PI * 100)\n"), "314 \n");
}

#[test]
fn data_read_with_restore_to_label() {
    let src = "10 DATA 1, 2, \"three\"\n\
               20 RESET: DATA 4, 5\n\
               30 READ A%, B%, C$\n\
               40 RESTORE RESET\n\
               50 READ A%\n\
               60 PRINT A%; \" \"; C$\n";
    // Numeric items print with a trailing space, so the literal \" \" adds a
    // second one.
    assert_eq!(run(src), "4  three\n");
}

#[test]
fn control_flow_with_labels_after_preprocessing() {
    let src = "10 GOTO 30\n20 PRINT \"NO\"\n30 PRINT \"YES\"\n";
    assert_eq!(run(src), "YES\n");
}

#[test]
fn for_next_with_option_base_1() {
    let src = "10 OPTION BASE 1\n\
               20 DIM A(3)\n\
               30 FOR I = 1 TO 3 : A(I) = I * I : NEXT I\n\
               40 PRINT A(1); A(2); A(3)\n";
    assert_eq!(run(src), "1 4 9 \n");
}

#[test]
fn timer_registration_fires_handlers() {
    let src = "10 EVERY 100 MS TICK\n\
               20 T% = 0\n\
               30 WHILE T% < 3 : WAIT_MS 150 : WEND\n\
               40 STOP TIMER ALL\n\
               50 PRINT T%\n\
               60 SUB TICK : T% = T% + 1 : ENDSUB\n";
    let out = run(src);
    let ticks: i64 = out.trim().parse().expect("numeric tick count");
    assert!((3..=5).contains(&ticks), "ticks = {}", ticks);
}

#[test]
fn semantic_error_reports_basic_line() {
    let errs = fbc::compile_source(
        "10 OPTION EXPLICIT\n20 X = 5\n",
        Path::new("."),
        &CompilerConfig::default(),
    )
    .unwrap_err();
    let first = errs.iter().find(|d| d.is_error()).unwrap();
    assert_eq!(first.basic_line, Some(20));
    let text = first.to_string().to_lowercase();
    assert!(text.contains("undeclared"), "{}", text);
    assert!(text.contains('x'), "{}", text);
}

// -- boundary behaviors -----------------------------------------------------

#[test]
fn empty_source_exits_cleanly_with_no_output() {
    assert_eq!(run(""), "");
}

#[test]
fn read_past_end_of_data_raises_out_of_data() {
    let err = run_with(
        "10 DATA 1\n20 READ A%, B%\n",
        &CompilerConfig::default(),
        &[],
    )
    .unwrap_err();
    assert!(err.contains("OUT OF DATA"), "{}", err);
    assert!(err.contains("BASIC line 20"), "{}", err);
}

#[test]
fn on_goto_out_of_range_falls_through() {
    let src = "10 X = 9\n\
               20 ON X GOTO A1, A2\n\
               30 PRINT \"FELL\"\n\
               40 END\n\
               50 A1: PRINT \"ONE\"\n\
               60 END\n\
               70 A2: PRINT \"TWO\"\n";
    assert_eq!(run(src), "FELL\n");
}

#[test]
fn on_goto_selects_one_based() {
    let src = "10 X = 2\n\
               20 ON X GOTO A1, A2\n\
               30 PRINT \"FELL\"\n\
               40 END\n\
               50 A1: PRINT \"ONE\"\n\
               60 END\n\
               70 A2: PRINT \"TWO\"\n";
    assert_eq!(run(src), "TWO\n");
}

#[test]
fn for_downto_zero_runs_zero_times() {
    let src = "10 FOR I = 1 TO 0\n20 PRINT I\n30 NEXT I\n40 PRINT \"DONE\"\n";
    assert_eq!(run(src), "DONE\n");
}

#[test]
fn for_with_negative_step_counts_down() {
    let src = "10 FOR I = 3 TO 1 STEP -1\n20 PRINT I;\n30 NEXT I\n";
    assert_eq!(run(src), "3 2 1 ");
}

// -- further end-to-end coverage --------------------------------------------

#[test]
fn gosub_return_resumes() {
    let src = "10 GOSUB SHOW\n\
               20 PRINT \"BACK\"\n\
               30 END\n\
               40 SHOW: PRINT \"SUB\"\n\
               50 RETURN\n";
    assert_eq!(run(src), "SUB\nBACK\n");
}

#[test]
fn nested_gosubs_unwind_in_order() {
    let src = "10 GOSUB OUTER\n\
               20 PRINT \"END\"\n\
               30 END\n\
               40 OUTER: GOSUB INNER\n\
               50 PRINT \"OUTER\"\n\
               60 RETURN\n\
               70 INNER: PRINT \"INNER\"\n\
               80 RETURN\n";
    assert_eq!(run(src), "INNER\nOUTER\nEND\n");
}

#[test]
fn single_line_if_then_else() {
    assert_eq!(run("10 X = 5\n20 IF X > 3 THEN PRINT \"BIG\" ELSE PRINT \"SMALL\"\n"), "BIG\n");
    assert_eq!(run("10 X = 1\n20 IF X > 3 THEN PRINT \"BIG\" ELSE PRINT \"SMALL\"\n"), "SMALL\n");
}

#[test]
fn if_then_line_number_branches() {
    let src = "10 X = 1\n20 IF X = 1 THEN 50\n30 PRINT \"NO\"\n40 END\n50 PRINT \"YES\"\n";
    assert_eq!(run(src), "YES\n");
}

#[test]
fn block_if_elseif_else() {
    let src = "10 X = 2\n\
               20 IF X = 1 THEN\n\
               30 PRINT \"ONE\"\n\
               40 ELSEIF X = 2 THEN\n\
               50 PRINT \"TWO\"\n\
               60 ELSE\n\
               70 PRINT \"MANY\"\n\
               80 ENDIF\n";
    assert_eq!(run(src), "TWO\n");
}

#[test]
fn select_case_dispatch() {
    let src = "10 X = 7\n\
               20 SELECT CASE X\n\
               30 CASE 1, 2\n\
               40 PRINT \"LOW\"\n\
               50 CASE IS > 5\n\
               60 PRINT \"HIGH\"\n\
               70 CASE ELSE\n\
               80 PRINT \"MID\"\n\
               90 ENDSELECT\n";
    assert_eq!(run(src), "HIGH\n");
}

#[test]
fn while_repeat_and_do_loops() {
    let src = "10 X = 0\n\
               20 WHILE X < 3\n\
               30 X = X + 1\n\
               40 WEND\n\
               50 REPEAT\n\
               60 X = X - 1\n\
               70 UNTIL X = 0\n\
               80 DO WHILE X < 2\n\
               90 X = X + 1\n\
               100 LOOP\n\
               110 PRINT X\n";
    assert_eq!(run(src), "2 \n");
}

#[test]
fn exit_for_leaves_the_loop() {
    let src = "10 FOR I = 1 TO 10\n\
               20 IF I = 3 THEN EXIT FOR\n\
               30 NEXT I\n\
               40 PRINT I\n";
    assert_eq!(run(src), "3 \n");
}

#[test]
fn string_functions_and_concat() {
    let src = "10 A$ = LEFT$(\"HELLO\", 2) + CHR$(33)\n\
               20 PRINT A$; LEN(A$)\n";
    assert_eq!(run(src), "HE!3 \n");
}

#[test]
fn string_coercion_functions() {
    let src = "10 PRINT VAL(\"42\") ; ASC(\"A\") ; HEX$(255)\n";
    assert_eq!(run(src), "42 65 FF\n");
}

#[test]
fn user_function_and_def_fn() {
    let src = "10 DEF FNDOUBLE(X) = X * 2\n\
               20 FUNCTION SQUARE%(N%)\n\
               30 SQUARE% = N% * N%\n\
               40 ENDFUNCTION\n\
               50 PRINT FNDOUBLE(4); SQUARE%(5)\n";
    assert_eq!(run(src), "8 25 \n");
}

#[test]
fn sub_with_parameters() {
    let src = "10 GREET \"WORLD\"\n\
               20 END\n\
               30 SUB GREET(WHO$)\n\
               40 PRINT \"HELLO \"; WHO$\n\
               50 ENDSUB\n";
    assert_eq!(run(src), "HELLO WORLD\n");
}

#[test]
fn multi_dimensional_arrays() {
    let src = "10 DIM G(2, 2)\n\
               20 G(1, 2) = 7\n\
               30 G(2, 1) = G(1, 2) + 1\n\
               40 PRINT G(1, 2); G(2, 1)\n";
    assert_eq!(run(src), "7 8 \n");
}

#[test]
fn redim_preserve_keeps_values() {
    let src = "10 DIM A(2)\n\
               20 A(1) = 5\n\
               30 REDIM PRESERVE A(4)\n\
               40 A(4) = 9\n\
               50 PRINT A(1); A(4)\n";
    assert_eq!(run(src), "5 9 \n");
}

#[test]
fn input_reads_scripted_lines() {
    let src = "10 INPUT \"NAME? \"; N$\n20 INPUT AGE%\n30 PRINT N$; AGE%\n";
    let out = run_with(src, &CompilerConfig::default(), &["ADA", "36"]).unwrap();
    assert_eq!(out, "NAME? ADA36 \n");
}

#[test]
fn integer_and_double_division() {
    assert_eq!(run("10 PRINT 7 / 2\n"), "3.5 \n");
    assert_eq!(run("10 PRINT 7 \\ 2\n"), "3 \n");
    assert_eq!(run("10 PRINT 7 MOD 2\n"), "1 \n");
}

#[test]
fn bitwise_and_logical_option() {
    assert_eq!(run("10 PRINT 6 AND 3\n"), "2 \n");
    assert_eq!(
        run("10 OPTION LOGICAL\n20 PRINT 6 AND 3\n"),
        "1 \n"
    );
}

#[test]
fn type_suffix_collision_keeps_variables_distinct() {
    let src = "10 A$ = \"S\"\n20 A% = 1\n30 A = 2.5\n40 PRINT A$; A%; A\n";
    assert_eq!(run(src), "S1 2.5 \n");
}

#[test]
fn integer_assignment_truncates() {
    assert_eq!(run("10 A% = 2.9\n20 PRINT A%\n"), "2 \n");
}

#[test]
fn optimized_and_unoptimized_agree() {
    let src = "10 T = 0\n\
               20 FOR I = 1 TO 5\n\
               30 T = T + I * 2 + 0\n\
               40 NEXT I\n\
               50 IF 1 THEN T = T + 100\n\
               60 PRINT T\n";
    let plain = run_with(src, &CompilerConfig::default(), &[]).unwrap();
    let optimized = run_with(
        src,
        &CompilerConfig::new().with_all_optimizations(),
        &[],
    )
    .unwrap();
    assert_eq!(plain, optimized);
    assert_eq!(plain, "130 \n");
}

#[test]
fn file_io_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let path_str = path.to_str().unwrap();
    let src = format!(
        "10 OPEN \"{p}\" FOR OUTPUT AS #1\n\
         20 PRINT #1, \"line one\"\n\
         30 CLOSE #1\n\
         40 OPEN \"{p}\" FOR INPUT AS #1\n\
         50 LINE INPUT #1, L$\n\
         60 PRINT L$; EOF(1)\n\
         70 CLOSE #1\n",
        p = path_str
    );
    assert_eq!(run(&src), "line one1 \n");
}

#[test]
fn after_timer_fires_once() {
    let src = "10 T% = 0\n\
               20 AFTER 30 MS BUMP\n\
               30 WAIT_MS 100\n\
               40 PRINT T%\n\
               50 SUB BUMP : T% = T% + 1 : ENDSUB\n";
    assert_eq!(run(src), "1 \n");
}

#[test]
fn stop_timer_by_handler_name() {
    let src = "10 T% = 0\n\
               20 EVERY 20 MS BUMP\n\
               30 WAIT_MS 50\n\
               40 STOP TIMER BUMP\n\
               50 X% = T%\n\
               60 WAIT_MS 60\n\
               70 PRINT T% - X%\n\
               80 SUB BUMP : T% = T% + 1 : ENDSUB\n";
    assert_eq!(run(src), "0 \n");
}
