fn main() -> anyhow::Result<()> {
    loja_backoffice_lib::run()
}
