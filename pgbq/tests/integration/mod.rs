mod catalog_test;
mod load_test;
mod merge_test;
