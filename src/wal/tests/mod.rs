mod helpers;

mod tests_rotation;
