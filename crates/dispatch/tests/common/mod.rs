pub mod test_env;
