fn main() {
    timetrack_lib::run()
}
