use crate::schema::{annotation_element, version_sequence};
use diesel::prelude::*;

/// Returns the next value of the version sequence shared by all annotations
/// and their elements. Values are strictly increasing and never reused; the
/// post-increment value is returned.
pub fn next(conn: &mut PgConnection) -> QueryResult<i64> {
    let updated = increment(conn)?;
    match updated {
        Some(version) => Ok(version),
        None => {
            initialize(conn)?;
            increment(conn).transpose().unwrap_or(Err(diesel::result::Error::NotFound))
        }
    }
}

fn increment(conn: &mut PgConnection) -> QueryResult<Option<i64>> {
    diesel::update(version_sequence::table)
        .set(version_sequence::version.eq(version_sequence::version + 1))
        .returning(version_sequence::version)
        .get_result(conn)
        .optional()
}

/// Seeds the sequence row if it doesn't exist yet. Databases that predate the
/// sequence start just past the highest persisted element version.
pub fn initialize(conn: &mut PgConnection) -> QueryResult<()> {
    let existing: Option<i64> = version_sequence::table
        .select(version_sequence::version)
        .first(conn)
        .optional()?;
    if existing.is_some() {
        return Ok(());
    }

    let highest: Option<i64> = annotation_element::table
        .select(diesel::dsl::max(annotation_element::version))
        .first(conn)?;
    let start = highest.map(|version| version + 1).unwrap_or(0);
    diesel::insert_into(version_sequence::table)
        .values((version_sequence::id.eq(true), version_sequence::version.eq(start)))
        .on_conflict_do_nothing()
        .execute(conn)
        .map(|_| ())
}
