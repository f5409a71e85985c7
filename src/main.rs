fn main() -> anyhow::Result<()> {
    p2pcall_lib::run()
}
