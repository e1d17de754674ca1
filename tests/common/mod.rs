use stowage_testsupport::{BinaryRunner, TestContext};

pub fn runner(ctx: &TestContext) -> BinaryRunner {
    BinaryRunner::new(env!("CARGO_BIN_EXE_stowage"), ctx.store_dir())
}

/// Build `script` as the entrypoint of a scratch image tagged `tag`.
pub async fn build_script_image(ctx: &TestContext, tag: &str, script: &str) {
    ctx.write_script("entry.sh", script).unwrap();
    ctx.write_recipe(
        "FROM scratch\nWORKDIR /app\nCOPY entry.sh .\nENTRYPOINT [\"./entry.sh\"]\n",
    )
    .unwrap();
    let output = runner(ctx)
        .output(&["build", "-t", tag, ctx.path().to_str().unwrap()])
        .await
        .unwrap();
    assert_eq!(output.code, Some(0), "build failed: {}", output.stderr);
}
