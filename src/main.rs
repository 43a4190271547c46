fn main() {
    poolgate::run();
}
