//! Filtering and projecting the rows of a single input.

use quarry_expr::Expr;
use quarry_lib::{ColId, ResultSetNumber, Row, RowLocation};

use crate::activation::Activation;
use crate::error::Result;
use crate::result_set::{Phase, ResultSet, ResultSetBase};

/// How a qualifying source row becomes an output row.
#[derive(Debug, Clone)]
pub enum Projection {
    /// The source row unchanged.
    Identity,
    /// The listed source columns, in order.
    Columns(Vec<ColId>),
    /// One expression per output column, evaluated over the source row.
    Exprs(Vec<Expr>),
}

impl Projection {
    pub fn columns(cols: &[u32]) -> Self {
        Self::Columns(cols.iter().copied().map(ColId).collect())
    }

    fn apply(&self, row: Row, cx: &Activation<'_>) -> Result<Row> {
        Ok(match self {
            Self::Identity => row,
            Self::Columns(cols) => row.project(cols),
            Self::Exprs(exprs) => exprs
                .iter()
                .map(|e| e.eval(&row, cx).map(|v| v.into_owned()))
                .collect::<Result<Row, _>>()?,
        })
    }
}

pub struct ProjectRestrictResultSet {
    base: ResultSetBase,
    source: Box<dyn ResultSet>,
    /// Depends on no column of the source, so it is evaluated once per open.
    constant_restriction: Option<Expr>,
    restriction: Option<Expr>,
    projection: Projection,
    /// The constant restriction was false at the last open, so the
    /// source was left unopened.
    short_circuited: bool,
}

impl ProjectRestrictResultSet {
    pub fn new(rsn: ResultSetNumber, source: Box<dyn ResultSet>) -> Self {
        Self {
            base: ResultSetBase::new(rsn),
            source,
            constant_restriction: None,
            restriction: None,
            projection: Projection::Identity,
            short_circuited: false,
        }
    }

    pub fn with_constant_restriction(mut self, restriction: Expr) -> Self {
        self.constant_restriction = Some(restriction);
        self
    }

    pub fn with_restriction(mut self, restriction: Expr) -> Self {
        self.restriction = Some(restriction);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn source(&self) -> &dyn ResultSet {
        &*self.source
    }

    fn constant_restriction_holds(&self, cx: &Activation<'_>) -> Result<bool> {
        match &self.constant_restriction {
            None => Ok(true),
            Some(expr) => Ok(expr.qualifies(&Row::default(), cx)?),
        }
    }
}

impl ResultSet for ProjectRestrictResultSet {
    fn kind(&self) -> &'static str {
        "project restrict"
    }

    fn base(&self) -> &ResultSetBase {
        &self.base
    }

    fn open_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        self.short_circuited = !self.constant_restriction_holds(cx)?;
        if self.short_circuited {
            log::trace!("CONSTANT RESTRICTION FALSE: rsn = {}", self.base.rsn);
        } else {
            self.source.open_core(cx)?;
        }
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn reopen_core(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        if !self.base.is_open {
            return self.open_core(cx);
        }
        let start = self.base.start_timer(cx);
        self.short_circuited = !self.constant_restriction_holds(cx)?;
        if !self.short_circuited {
            if self.source.is_open() {
                self.source.reopen_core(cx)?;
            } else {
                self.source.open_core(cx)?;
            }
        }
        self.base.mark_open();
        self.base.stop_timer(start, Phase::Open);
        Ok(())
    }

    fn next_row_core(&mut self, cx: &mut Activation<'_>) -> Result<Option<Row>> {
        self.base.check_open("next_row")?;
        if self.short_circuited {
            self.base.set_current_row(cx, None);
            return Ok(None);
        }
        let start = self.base.start_timer(cx);
        let mut result = None;
        while let Some(candidate) = self.source.next_row_core(cx)? {
            self.base.stats.rows_seen += 1;
            let qualifies = match &self.restriction {
                Some(restriction) => restriction.qualifies(&candidate, &*cx)?,
                None => true,
            };
            if qualifies {
                result = Some(self.projection.apply(candidate, cx)?);
                break;
            }
            self.base.stats.rows_filtered += 1;
        }
        self.base.set_current_row(cx, result.as_ref());
        self.base.stop_timer(start, Phase::Next);
        Ok(result)
    }

    fn close(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        let start = self.base.start_timer(cx);
        let res = self.source.close(cx);
        self.base.mark_closed(cx);
        self.base.stop_timer(start, Phase::Close);
        res
    }

    fn finish(&mut self, cx: &mut Activation<'_>) -> Result<()> {
        self.source.finish(cx)
    }

    fn requires_relocking(&self) -> Result<bool> {
        self.source.requires_relocking()
    }

    fn row_location(&self) -> Result<RowLocation> {
        self.source.row_location()
    }
}
