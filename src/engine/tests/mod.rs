mod helpers;

mod tests_insert_query;
mod tests_retention;
mod tests_corruption;
