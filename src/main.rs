fn main() -> anyhow::Result<()> {
    grism_prep::cli_main::main()
}
