fn main() -> anyhow::Result<()> {
    commitinfo_indexer::run()
}
